use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::messages::{
    ActivationMessage, Commit, CommitError, CommitErrorKind, DeactivationMessage, Envelope,
    NodeState, Operation, ProcessInstanceId, TriggerMessage,
};
use crate::error::CoreError;
use crate::identity::FlowNodeId;

/// Why a request produced no commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unanswered {
    Timeout,
    MailboxClosed,
}

/// Cloneable address of a running node service
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    node_id: FlowNodeId,
    sender: mpsc::Sender<Envelope>,
}

impl NodeEndpoint {
    /// Create an endpoint together with the mailbox its node service drains
    pub(crate) fn channel(node_id: FlowNodeId, capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { node_id, sender }, receiver)
    }

    pub fn node_id(&self) -> &FlowNodeId {
        &self.node_id
    }

    /// True once the node service has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn activate(&self, message: ActivationMessage, deadline: Instant) -> Commit {
        let instance_id = message.instance_id.clone();
        self.commit_or_failure(Operation::Activate(message), instance_id, deadline)
            .await
    }

    pub async fn deactivate(&self, message: DeactivationMessage, deadline: Instant) -> Commit {
        let instance_id = message.instance_id.clone();
        self.commit_or_failure(Operation::Deactivate(message), instance_id, deadline)
            .await
    }

    pub async fn trigger(&self, message: TriggerMessage, deadline: Instant) -> Commit {
        let instance_id = message.instance_id.clone();
        self.commit_or_failure(Operation::Trigger(message), instance_id, deadline)
            .await
    }

    /// Convenience for activating with a fresh payload
    pub async fn activate_instance(
        &self,
        instance_id: &ProcessInstanceId,
        payload: Option<Value>,
        deadline: Instant,
    ) -> Commit {
        self.activate(
            ActivationMessage {
                instance_id: instance_id.clone(),
                payload,
            },
            deadline,
        )
        .await
    }

    /// Current coarse state of this node for an instance
    pub async fn state(&self, instance_id: &ProcessInstanceId) -> Result<NodeState, CoreError> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(Envelope {
                operation: Operation::State(instance_id.clone(), sender),
                deadline: Instant::now(),
                reply: None,
            })
            .await
            .map_err(|_| self.not_running())?;
        receiver.await.map_err(|_| self.not_running())
    }

    /// Ask the node service to exit its message loop
    pub async fn stop(&self) -> Result<(), CoreError> {
        self.sender
            .send(Envelope {
                operation: Operation::Stop,
                deadline: Instant::now(),
                reply: None,
            })
            .await
            .map_err(|_| self.not_running())
    }

    pub(crate) async fn notify_completed(&self, instance_id: &ProcessInstanceId, activation: u64) {
        let envelope = Envelope {
            operation: Operation::Completed(instance_id.clone(), activation),
            deadline: Instant::now(),
            reply: None,
        };
        if self.sender.send(envelope).await.is_err() {
            debug!(node_id = %self.node_id, instance_id = %instance_id, "Node service gone before completion notice");
        }
    }

    /// Send an operation and wait for its commit until `deadline`
    pub(crate) async fn request(
        &self,
        operation: Operation,
        deadline: Instant,
    ) -> Result<Commit, Unanswered> {
        let (sender, receiver) = oneshot::channel();
        let envelope = Envelope {
            operation,
            deadline,
            reply: Some(sender),
        };

        let exchange = async {
            self.sender
                .send(envelope)
                .await
                .map_err(|_| Unanswered::MailboxClosed)?;
            receiver.await.map_err(|_| Unanswered::MailboxClosed)
        };

        match timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Unanswered::Timeout),
        }
    }

    pub(crate) fn unanswered_commit(
        &self,
        instance_id: ProcessInstanceId,
        operation: &str,
        reason: Unanswered,
    ) -> Commit {
        let error = match reason {
            Unanswered::Timeout => CommitError::new(
                CommitErrorKind::Timeout,
                format!("node {} did not commit {} before the deadline", self.node_id, operation),
            ),
            Unanswered::MailboxClosed => CommitError::new(
                CommitErrorKind::MailboxClosed,
                format!("node {} is not running", self.node_id),
            ),
        };
        Commit::failure(
            instance_id,
            self.node_id.clone(),
            error.with_nodes(vec![self.node_id.clone()]),
        )
    }

    async fn commit_or_failure(
        &self,
        operation: Operation,
        instance_id: ProcessInstanceId,
        deadline: Instant,
    ) -> Commit {
        let name = operation.name();
        match self.request(operation, deadline).await {
            Ok(commit) => commit,
            Err(reason) => self.unanswered_commit(instance_id, name, reason),
        }
    }

    fn not_running(&self) -> CoreError {
        CoreError::RegistryError(format!("node service {} is not running", self.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endpoint(capacity: usize) -> (NodeEndpoint, mpsc::Receiver<Envelope>) {
        NodeEndpoint::channel(FlowNodeId("n1".to_string()), capacity)
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_yields_timeout_commit() {
        let (endpoint, _mailbox) = endpoint(4);
        let instance = ProcessInstanceId::new();
        let started = Instant::now();

        let commit = endpoint
            .activate_instance(&instance, None, started + Duration::from_secs(2))
            .await;

        assert!(!commit.ok);
        assert_eq!(commit.error_kind(), Some(CommitErrorKind::Timeout));
        assert_eq!(commit.error.unwrap().nodes, vec![FlowNodeId("n1".to_string())]);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_millis(2_010));
    }

    #[tokio::test]
    async fn test_closed_mailbox_yields_failure_commit() {
        let (endpoint, mailbox) = endpoint(4);
        drop(mailbox);
        assert!(endpoint.is_closed());

        let commit = endpoint
            .deactivate(
                DeactivationMessage {
                    instance_id: ProcessInstanceId::new(),
                },
                Instant::now() + Duration::from_secs(1),
            )
            .await;

        assert_eq!(commit.error_kind(), Some(CommitErrorKind::MailboxClosed));
        assert!(endpoint.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_reply_is_returned_unchanged() {
        let (endpoint, mut mailbox) = endpoint(4);
        let instance = ProcessInstanceId::new();

        tokio::spawn(async move {
            if let Some(envelope) = mailbox.recv().await {
                if let Operation::Trigger(message) = envelope.operation {
                    let commit = Commit::success(
                        message.instance_id,
                        FlowNodeId("n1".to_string()),
                        message.payload,
                    );
                    let _ = envelope.reply.unwrap().send(commit);
                }
            }
        });

        let commit = endpoint
            .trigger(
                TriggerMessage {
                    instance_id: instance.clone(),
                    payload: Some(serde_json::json!({ "paid": true })),
                },
                Instant::now() + Duration::from_secs(1),
            )
            .await;

        assert!(commit.ok);
        assert_eq!(commit.instance_id, instance);
        assert_eq!(commit.payload, Some(serde_json::json!({ "paid": true })));
    }
}
