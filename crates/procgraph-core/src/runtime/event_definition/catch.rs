use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{Continuation, EventDefinition, NodeContext};
use crate::runtime::messages::{
    ActivationMessage, CommitError, DeactivationMessage, NodeState, TriggerMessage,
};

/// Receive tasks and message/signal catch events: wait for a trigger, then proceed
#[derive(Debug, Clone, Default)]
pub struct MessageCatchEventDefinition {
    reference: Option<String>,
}

impl MessageCatchEventDefinition {
    pub fn new(reference: Option<String>) -> Self {
        Self { reference }
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }
}

#[async_trait]
impl EventDefinition for MessageCatchEventDefinition {
    fn name(&self) -> &'static str {
        "message-catch"
    }

    async fn activate(
        &self,
        ctx: &NodeContext,
        message: &ActivationMessage,
        _deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        debug!(
            node_id = %ctx.node_id,
            instance_id = %message.instance_id,
            reference = ?self.reference,
            "Waiting for message"
        );
        Ok(Continuation::Await)
    }

    async fn deactivate(
        &self,
        _ctx: &NodeContext,
        _message: &DeactivationMessage,
        _deadline: Instant,
    ) -> Result<(), CommitError> {
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
            NodeState::Active => Ok(Continuation::Proceed(message.payload.clone())),
            NodeState::Inactive => Err(CommitError::protocol_violation(
                &ctx.node_id,
                format!("node is not waiting for instance {}", message.instance_id),
            )),
        }
    }
}
