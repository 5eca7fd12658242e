use async_trait::async_trait;
use tokio::time::Instant;

use super::{Continuation, EventDefinition, NodeContext};
use crate::runtime::messages::{
    ActivationMessage, CommitError, DeactivationMessage, NodeState, TriggerMessage,
};

/// Pass-through behavior of start and end events, tasks and forking gateways
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyEventDefinition;

#[async_trait]
impl EventDefinition for EmptyEventDefinition {
    fn name(&self) -> &'static str {
        "empty"
    }

    async fn activate(
        &self,
        _ctx: &NodeContext,
        message: &ActivationMessage,
        _deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        Ok(Continuation::Proceed(message.payload.clone()))
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
        _message: &TriggerMessage,
        _state: NodeState,
        _deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        Err(CommitError::protocol_violation(
            &ctx.node_id,
            format!("{} nodes do not accept triggers", ctx.kind),
        ))
    }
}
