use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{Continuation, EventDefinition, NodeContext};
use crate::runtime::messages::{
    ActivationMessage, CommitError, DeactivationMessage, NodeState, ProcessInstanceId,
    TriggerMessage,
};

/// Waits a fixed duration, then triggers its own node
#[derive(Debug)]
pub struct TimerEventDefinition {
    duration: Duration,
    /// At most one pending timer per instance
    pending: DashMap<ProcessInstanceId, AbortHandle>,
}

impl TimerEventDefinition {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            pending: DashMap::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_pending(&self, instance_id: &ProcessInstanceId) -> bool {
        self.pending.contains_key(instance_id)
    }

    fn cancel(&self, instance_id: &ProcessInstanceId) {
        if let Some((_, handle)) = self.pending.remove(instance_id) {
            handle.abort();
        }
    }
}

impl Drop for TimerEventDefinition {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.value().abort();
        }
    }
}

#[async_trait]
impl EventDefinition for TimerEventDefinition {
    fn name(&self) -> &'static str {
        "timer"
    }

    async fn activate(
        &self,
        ctx: &NodeContext,
        message: &ActivationMessage,
        _deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        let endpoint = ctx.endpoint.clone();
        let timeout = ctx.config.operation_timeout();
        let duration = self.duration;
        let fired = TriggerMessage {
            instance_id: message.instance_id.clone(),
            payload: message.payload.clone(),
        };

        let task = tokio::spawn(async move {
            sleep(duration).await;
            let instance_id = fired.instance_id.clone();
            let commit = endpoint.trigger(fired, Instant::now() + timeout).await;
            if !commit.ok {
                debug!(
                    node_id = %endpoint.node_id(),
                    instance_id = %instance_id,
                    error = ?commit.error,
                    "Timer trigger not accepted"
                );
            }
        });

        // A repeated activation restarts the timer
        if let Some(previous) = self
            .pending
            .insert(message.instance_id.clone(), task.abort_handle())
        {
            previous.abort();
        }
        Ok(Continuation::Await)
    }

    async fn deactivate(
        &self,
        ctx: &NodeContext,
        message: &DeactivationMessage,
        _deadline: Instant,
    ) -> Result<(), CommitError> {
        if self.is_pending(&message.instance_id) {
            debug!(node_id = %ctx.node_id, instance_id = %message.instance_id, "Timer cancelled");
        }
        self.cancel(&message.instance_id);
        Ok(())
    }

    async fn trigger(
        &self,
        ctx: &NodeContext,
        message: &TriggerMessage,
        state: NodeState,
        _deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        match state {
            NodeState::Active => {
                // Fired, or completed early from outside; nothing may fire later
                self.cancel(&message.instance_id);
                Ok(Continuation::Proceed(message.payload.clone()))
            }
            NodeState::Inactive => Err(CommitError::protocol_violation(
                &ctx.node_id,
                format!("timer is not running for instance {}", message.instance_id),
            )),
        }
    }
}
