//! Bounded-wait aggregation over many node services.
//!
//! Every request shares one absolute deadline, so the joined future always
//! resolves by that deadline no matter how many targets stay silent.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::endpoint::{NodeEndpoint, Unanswered};
use super::messages::{
    ActivationMessage, Commit, CommitError, CommitErrorKind, DeactivationMessage, Operation,
    ProcessInstanceId,
};
use crate::identity::FlowNodeId;

/// Outcome of one fan-out, partitioned by how each target answered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanOutReport {
    pub confirmed: Vec<FlowNodeId>,
    /// Failure commits, as received or synthesized for a closed mailbox
    pub failed: Vec<Commit>,
    /// Targets that did not answer before the deadline
    pub unresponsive: Vec<FlowNodeId>,
}

impl FanOutReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.unresponsive.is_empty()
    }

    pub fn total(&self) -> usize {
        self.confirmed.len() + self.failed.len() + self.unresponsive.len()
    }

    /// Every target that did not confirm
    pub fn unconfirmed(&self) -> Vec<FlowNodeId> {
        self.failed
            .iter()
            .map(|commit| commit.node_id.clone())
            .chain(self.unresponsive.iter().cloned())
            .collect()
    }

    /// Fold the report into the commit a node replies with after propagating.
    ///
    /// A single downstream failure is passed on unchanged.
    pub fn into_commit(
        self,
        instance_id: &ProcessInstanceId,
        node_id: &FlowNodeId,
        payload: Option<Value>,
    ) -> Commit {
        if self.is_success() {
            return Commit::success(instance_id.clone(), node_id.clone(), payload);
        }

        if self.failed.len() == 1 && self.unresponsive.is_empty() {
            if let Some(error) = self.failed.into_iter().next().and_then(|c| c.error) {
                return Commit::failure(instance_id.clone(), node_id.clone(), error);
            }
            return Commit::failure(
                instance_id.clone(),
                node_id.clone(),
                CommitError::new(CommitErrorKind::DownstreamFailure, "downstream node failed"),
            );
        }

        let mut origins: Vec<FlowNodeId> = Vec::new();
        for commit in &self.failed {
            match &commit.error {
                Some(error) if !error.nodes.is_empty() => origins.extend(error.nodes.iter().cloned()),
                _ => origins.push(commit.node_id.clone()),
            }
        }
        origins.extend(self.unresponsive.iter().cloned());

        let error = CommitError::new(
            CommitErrorKind::DownstreamFailure,
            format!(
                "{} downstream node(s) failed and {} did not respond",
                self.failed.len(),
                self.unresponsive.len()
            ),
        )
        .with_nodes(origins);
        Commit::failure(instance_id.clone(), node_id.clone(), error)
    }

    fn record(
        &mut self,
        endpoint: &NodeEndpoint,
        outcome: Result<Commit, Unanswered>,
        instance_id: &ProcessInstanceId,
        operation: &str,
    ) {
        match outcome {
            Ok(commit) if commit.ok => self.confirmed.push(endpoint.node_id().clone()),
            Ok(commit) => self.failed.push(commit),
            Err(Unanswered::Timeout) => self.unresponsive.push(endpoint.node_id().clone()),
            Err(reason @ Unanswered::MailboxClosed) => {
                self.failed
                    .push(endpoint.unanswered_commit(instance_id.clone(), operation, reason))
            }
        }
    }
}

/// Activate every endpoint concurrently and wait until all answered or `deadline` passed
pub async fn activate_all(
    endpoints: &[NodeEndpoint],
    instance_id: &ProcessInstanceId,
    payload: Option<Value>,
    deadline: Instant,
) -> FanOutReport {
    let requests = endpoints.iter().map(|endpoint| {
        let message = ActivationMessage {
            instance_id: instance_id.clone(),
            payload: payload.clone(),
        };
        endpoint.request(Operation::Activate(message), deadline)
    });
    collect(endpoints, join_all(requests).await, instance_id, "activate")
}

/// Deactivate every endpoint concurrently and wait until all answered or `deadline` passed
pub async fn deactivate_all(
    endpoints: &[NodeEndpoint],
    instance_id: &ProcessInstanceId,
    deadline: Instant,
) -> FanOutReport {
    let requests = endpoints.iter().map(|endpoint| {
        let message = DeactivationMessage {
            instance_id: instance_id.clone(),
        };
        endpoint.request(Operation::Deactivate(message), deadline)
    });
    collect(endpoints, join_all(requests).await, instance_id, "deactivate")
}

fn collect(
    endpoints: &[NodeEndpoint],
    outcomes: Vec<Result<Commit, Unanswered>>,
    instance_id: &ProcessInstanceId,
    operation: &str,
) -> FanOutReport {
    let mut report = FanOutReport::default();
    for (endpoint, outcome) in endpoints.iter().zip(outcomes) {
        report.record(endpoint, outcome, instance_id, operation);
    }
    report
}
