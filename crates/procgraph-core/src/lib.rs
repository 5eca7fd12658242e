//! Core runtime for procgraph.
//!
//! A process definition is materialized into two persisted graphs, a running
//! graph that drives execution and an archive graph kept for history, and one
//! node service per flow node. Node services speak a small asynchronous
//! protocol (activate, deactivate, trigger, each answered by a commit) and
//! delegate node-specific behavior to an event definition.

#![forbid(unsafe_code)]

/// Engine configuration
pub mod config;

/// Parsed process definitions and node kinds
pub mod definition;

/// Process engine facade
pub mod engine;

/// Error types
pub mod error;

/// Graph entities, the Graph Store contract and the builder
pub mod graph;

/// Deterministic process and flow node ids
pub mod identity;

/// Node services, messages and event definitions
pub mod runtime;

pub use config::EngineConfig;
pub use definition::{
    EventDefinitionSpec, FlowElement, FlowNodeDefinition, NodeKind, ProcessDefinition,
    SequenceFlowDefinition,
};
pub use engine::ProcessEngine;
pub use error::{CoreError, GraphStoreError};
pub use graph::{GraphBuilder, GraphStore, ProcessRoots, RelationKind, Vertex, VertexKey, VertexKind};
pub use identity::{FlowNodeId, ProcessId, SubProcessPath, ARCHIVE_PREFIX};
pub use runtime::{
    Commit, CommitError, CommitErrorKind, InMemoryNodeRegistry, NodeEndpoint, NodeRegistry,
    NodeState, NodeTransition, ProcessInstanceId,
};
