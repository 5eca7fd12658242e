use async_trait::async_trait;
use tokio::time::Instant;

use super::{Continuation, EventDefinition, NodeContext};
use crate::runtime::endpoint::NodeEndpoint;
use crate::runtime::messages::{
    ActivationMessage, CommitError, DeactivationMessage, NodeState, TriggerMessage,
};

/// Sub-process container: runs its embedded flow before its own outgoing flows
#[derive(Debug, Clone)]
pub struct SubProcessEventDefinition {
    entry_points: Vec<NodeEndpoint>,
}

impl SubProcessEventDefinition {
    pub fn new(entry_points: Vec<NodeEndpoint>) -> Self {
        Self { entry_points }
    }

    pub fn entry_points(&self) -> &[NodeEndpoint] {
        &self.entry_points
    }
}

#[async_trait]
impl EventDefinition for SubProcessEventDefinition {
    fn name(&self) -> &'static str {
        "sub-process"
    }

    async fn activate(
        &self,
        _ctx: &NodeContext,
        message: &ActivationMessage,
        _deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        Ok(Continuation::Descend {
            entry_points: self.entry_points.clone(),
            payload: message.payload.clone(),
        })
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
            "sub-processes do not accept triggers",
        ))
    }
}
