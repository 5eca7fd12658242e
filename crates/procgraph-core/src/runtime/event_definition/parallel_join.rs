use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::{Continuation, EventDefinition, NodeContext};
use crate::runtime::messages::{
    ActivationMessage, CommitError, DeactivationMessage, NodeState, ProcessInstanceId,
    TriggerMessage,
};

/// Synchronizing parallel gateway: proceeds once every incoming flow arrived
#[derive(Debug)]
pub struct ParallelJoinEventDefinition {
    expected: usize,
    arrivals: DashMap<ProcessInstanceId, usize>,
}

impl ParallelJoinEventDefinition {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            arrivals: DashMap::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn arrivals(&self, instance_id: &ProcessInstanceId) -> usize {
        self.arrivals.get(instance_id).map(|count| *count).unwrap_or(0)
    }
}

#[async_trait]
impl EventDefinition for ParallelJoinEventDefinition {
    fn name(&self) -> &'static str {
        "parallel-join"
    }

    async fn activate(
        &self,
        ctx: &NodeContext,
        message: &ActivationMessage,
        _deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        let arrived = {
            let mut count = self.arrivals.entry(message.instance_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        debug!(
            node_id = %ctx.node_id,
            instance_id = %message.instance_id,
            arrived,
            expected = self.expected,
            "Join arrival"
        );

        if arrived >= self.expected {
            self.arrivals.remove(&message.instance_id);
            Ok(Continuation::Proceed(message.payload.clone()))
        } else {
            Ok(Continuation::Await)
        }
    }

    async fn deactivate(
        &self,
        _ctx: &NodeContext,
        message: &DeactivationMessage,
        _deadline: Instant,
    ) -> Result<(), CommitError> {
        self.arrivals.remove(&message.instance_id);
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
            "parallel gateways do not accept triggers",
        ))
    }
}
