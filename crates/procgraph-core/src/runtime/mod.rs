//! Node services and the activation protocol they speak.

pub mod endpoint;
pub mod event_definition;
pub mod fanout;
pub mod messages;
pub mod node_service;
pub mod registry;

pub use endpoint::NodeEndpoint;
pub use event_definition::{Continuation, EventDefinition, NodeContext, TerminationReport};
pub use fanout::{activate_all, deactivate_all, FanOutReport};
pub use messages::{
    ActivationMessage, Commit, CommitError, CommitErrorKind, DeactivationMessage, NodeState,
    NodeTransition, ProcessInstanceId, TriggerMessage,
};
pub use node_service::{NodeBlueprint, NodeService};
pub use registry::{InMemoryNodeRegistry, NodeDescriptor, NodeRegistry};
