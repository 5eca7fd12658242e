//! Structured log events for node state transitions.

use procgraph_core::runtime::NodeTransition;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Human readable one-liner for a transition
pub fn describe(transition: &NodeTransition) -> String {
    format!(
        "{} {:?} -> {:?} (instance {})",
        transition.node_id, transition.from, transition.to, transition.instance_id
    )
}

/// Log every transition until the engine drops its sender.
///
/// A lagging receiver reports how many transitions it missed and keeps going.
pub fn spawn_transition_logger(mut receiver: broadcast::Receiver<NodeTransition>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut logged = 0u64;
        loop {
            match receiver.recv().await {
                Ok(transition) => {
                    info!(
                        node_id = %transition.node_id,
                        instance_id = %transition.instance_id,
                        from = ?transition.from,
                        to = ?transition.to,
                        at = %transition.at,
                        "Node transition"
                    );
                    logged += 1;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Transition logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(logged, "Transition logger stopped");
        logged
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use procgraph_core::runtime::{NodeState, ProcessInstanceId};
    use procgraph_core::FlowNodeId;

    fn transition(n: usize) -> NodeTransition {
        NodeTransition {
            node_id: FlowNodeId(format!("node-{}", n)),
            instance_id: ProcessInstanceId("i-1".to_string()),
            from: NodeState::Inactive,
            to: NodeState::Active,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&transition(3)), "node-3 Inactive -> Active (instance i-1)");
    }

    #[tokio::test]
    async fn test_logger_counts_until_closed() {
        let (sender, receiver) = broadcast::channel(16);
        let handle = spawn_transition_logger(receiver);
        for n in 0..3 {
            sender.send(transition(n)).unwrap();
        }
        drop(sender);
        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_logger_survives_lag() {
        let (sender, receiver) = broadcast::channel(2);
        // Fill past capacity before the logger gets to run
        for n in 0..5 {
            sender.send(transition(n)).unwrap();
        }
        let handle = spawn_transition_logger(receiver);
        drop(sender);
        assert_eq!(handle.await.unwrap(), 2);
    }
}
