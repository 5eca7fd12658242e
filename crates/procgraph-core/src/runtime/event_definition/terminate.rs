use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{Continuation, EventDefinition, NodeContext};
use crate::config::{scaled, EngineConfig};
use crate::identity::{FlowNodeId, ProcessId};
use crate::runtime::endpoint::NodeEndpoint;
use crate::runtime::fanout::{deactivate_all, FanOutReport};
use crate::runtime::messages::{
    ActivationMessage, CommitError, CommitErrorKind, DeactivationMessage, NodeState,
    TriggerMessage,
};

/// Structured payload of a terminate commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationReport {
    pub confirmed: Vec<FlowNodeId>,
    /// Nodes that answered with a failure or whose service is gone
    pub failed: Vec<FlowNodeId>,
    /// Nodes that did not answer before the bound
    pub unresponsive: Vec<FlowNodeId>,
}

impl From<&FanOutReport> for TerminationReport {
    fn from(report: &FanOutReport) -> Self {
        Self {
            confirmed: report.confirmed.clone(),
            failed: report.failed.iter().map(|c| c.node_id.clone()).collect(),
            unresponsive: report.unresponsive.clone(),
        }
    }
}

/// Ends a whole process instance by deactivating every other node of the process
#[derive(Debug, Clone)]
pub struct TerminateEventDefinition {
    process_id: ProcessId,
    node_id: FlowNodeId,
    endpoint: NodeEndpoint,
    targets: Vec<NodeEndpoint>,
    operation_timeout: Duration,
    fraction: f64,
}

impl TerminateEventDefinition {
    /// `endpoints` may include this node's own endpoint; it is never a target
    pub fn new(
        process_id: ProcessId,
        node_id: FlowNodeId,
        endpoint: NodeEndpoint,
        endpoints: Vec<NodeEndpoint>,
        config: &EngineConfig,
    ) -> Self {
        let targets = endpoints
            .into_iter()
            .filter(|target| target.node_id() != &node_id)
            .collect();
        Self {
            process_id,
            node_id,
            endpoint,
            targets,
            operation_timeout: config.operation_timeout(),
            fraction: config.deactivation_timeout_fraction,
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &FlowNodeId> {
        self.targets.iter().map(NodeEndpoint::node_id)
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    /// Strictly inside both this node's own timeout and the caller's deadline
    fn fan_in_deadline(&self, caller_deadline: Instant) -> Instant {
        let now = Instant::now();
        let remaining = caller_deadline
            .saturating_duration_since(now)
            .min(self.operation_timeout);
        now + scaled(remaining, self.fraction)
    }
}

#[async_trait]
impl EventDefinition for TerminateEventDefinition {
    fn name(&self) -> &'static str {
        "terminate"
    }

    async fn activate(
        &self,
        _ctx: &NodeContext,
        message: &ActivationMessage,
        deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        let bound = self.fan_in_deadline(deadline);
        info!(
            process_id = %self.process_id,
            node_id = %self.node_id,
            instance_id = %message.instance_id,
            targets = self.targets.len(),
            "Terminating process instance"
        );

        let report = deactivate_all(&self.targets, &message.instance_id, bound).await;
        let summary = TerminationReport::from(&report);
        let details = serde_json::to_value(&summary).ok();

        if report.is_success() {
            return Ok(Continuation::Complete(details));
        }

        let unconfirmed = report.unconfirmed();
        warn!(
            process_id = %self.process_id,
            node_id = %self.node_id,
            instance_id = %message.instance_id,
            unconfirmed = ?unconfirmed,
            "Termination incomplete"
        );
        let mut error = CommitError::new(
            CommitErrorKind::DeactivationIncomplete,
            format!(
                "{} of {} nodes did not confirm deactivation",
                unconfirmed.len(),
                report.total()
            ),
        )
        .with_nodes(unconfirmed);
        if let Some(details) = details {
            error = error.with_details(details);
        }
        Err(error)
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
        _ctx: &NodeContext,
        _message: &TriggerMessage,
        _state: NodeState,
        _deadline: Instant,
    ) -> Result<Continuation, CommitError> {
        Ok(Continuation::Unchanged(None))
    }
}
