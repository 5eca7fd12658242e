//! Messages exchanged with node services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::identity::FlowNodeId;

/// Identifies one execution of a process definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessInstanceId(pub String);

impl ProcessInstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ProcessInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationMessage {
    pub instance_id: ProcessInstanceId,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationMessage {
    pub instance_id: ProcessInstanceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub instance_id: ProcessInstanceId,
    pub payload: Option<Value>,
}

/// Coarse per (node, instance) state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Inactive,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitErrorKind {
    /// No reply arrived before the deadline
    Timeout,
    /// The node service is gone
    MailboxClosed,
    /// The operation is not supported by the node in its current state
    ProtocolViolation,
    /// One or more downstream nodes failed
    DownstreamFailure,
    /// Terminate could not confirm every deactivation
    DeactivationIncomplete,
    /// Node-kind specific behavior failed
    EventDefinition,
}

/// Failure carried by a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitError {
    pub kind: CommitErrorKind,
    pub message: String,
    /// Nodes the failure originated from
    pub nodes: Vec<FlowNodeId>,
    #[serde(default)]
    pub details: Option<Value>,
}

impl CommitError {
    pub fn new(kind: CommitErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            nodes: Vec::new(),
            details: None,
        }
    }

    pub fn protocol_violation(node_id: &FlowNodeId, message: impl Into<String>) -> Self {
        Self::new(CommitErrorKind::ProtocolViolation, message).with_nodes(vec![node_id.clone()])
    }

    pub fn with_nodes(mut self, nodes: Vec<FlowNodeId>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Asynchronous reply to Activate, Deactivate or Trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub instance_id: ProcessInstanceId,
    /// Node that produced this commit
    pub node_id: FlowNodeId,
    pub ok: bool,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<CommitError>,
}

impl Commit {
    pub fn success(instance_id: ProcessInstanceId, node_id: FlowNodeId, payload: Option<Value>) -> Self {
        Self {
            instance_id,
            node_id,
            ok: true,
            payload,
            error: None,
        }
    }

    pub fn failure(instance_id: ProcessInstanceId, node_id: FlowNodeId, error: CommitError) -> Self {
        Self {
            instance_id,
            node_id,
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    pub fn error_kind(&self) -> Option<CommitErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// A state change of one node for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTransition {
    pub node_id: FlowNodeId,
    pub instance_id: ProcessInstanceId,
    pub from: NodeState,
    pub to: NodeState,
    pub at: DateTime<Utc>,
}

/// Operations a node service accepts through its mailbox
#[derive(Debug)]
pub(crate) enum Operation {
    Activate(ActivationMessage),
    Deactivate(DeactivationMessage),
    Trigger(TriggerMessage),
    State(ProcessInstanceId, oneshot::Sender<NodeState>),
    /// Downstream propagation finished; carries the activation it was started by
    Completed(ProcessInstanceId, u64),
    Stop,
}

impl Operation {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Operation::Activate(_) => "activate",
            Operation::Deactivate(_) => "deactivate",
            Operation::Trigger(_) => "trigger",
            Operation::State(..) => "state",
            Operation::Completed(..) => "completed",
            Operation::Stop => "stop",
        }
    }
}

/// Mailbox entry: an operation, its absolute deadline and the reply channel
#[derive(Debug)]
pub(crate) struct Envelope {
    pub operation: Operation,
    pub deadline: Instant,
    pub reply: Option<oneshot::Sender<Commit>>,
}
