use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::endpoint::NodeEndpoint;
use crate::definition::NodeKind;
use crate::error::CoreError;
use crate::identity::{FlowNodeId, ProcessId, SubProcessPath};

/// What the registry knows about a node besides its endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: FlowNodeId,
    pub process_id: ProcessId,
    /// Id of the node inside its definition
    pub local_id: String,
    pub kind: NodeKind,
    /// Enclosing sub-process node, `None` at the top level
    pub parent: Option<FlowNodeId>,
    pub path: SubProcessPath,
}

impl NodeDescriptor {
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

/// Resolves deterministic node ids to live node service endpoints
pub trait NodeRegistry: Send + Sync {
    /// Register or replace the endpoint of a node
    fn register(&self, descriptor: NodeDescriptor, endpoint: NodeEndpoint) -> Result<(), CoreError>;

    fn resolve(&self, node_id: &FlowNodeId) -> Option<NodeEndpoint>;

    /// Every endpoint of a process, top-level and nested, ordered by node id
    fn resolve_all(&self, process_id: &ProcessId) -> Vec<NodeEndpoint>;

    fn descriptors(&self, process_id: &ProcessId) -> Vec<NodeDescriptor>;

    /// Forget every node of a process, returning their endpoints
    fn remove_process(&self, process_id: &ProcessId) -> Vec<NodeEndpoint>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryNodeRegistry {
    nodes: DashMap<FlowNodeId, (NodeDescriptor, NodeEndpoint)>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, process_id: &ProcessId) -> Vec<(NodeDescriptor, NodeEndpoint)> {
        let mut entries: Vec<(NodeDescriptor, NodeEndpoint)> = self
            .nodes
            .iter()
            .filter(|entry| &entry.value().0.process_id == process_id)
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.0.node_id.cmp(&b.0.node_id));
        entries
    }
}

impl NodeRegistry for InMemoryNodeRegistry {
    fn register(&self, descriptor: NodeDescriptor, endpoint: NodeEndpoint) -> Result<(), CoreError> {
        if &descriptor.node_id != endpoint.node_id() {
            return Err(CoreError::RegistryError(format!(
                "endpoint {} registered under node id {}",
                endpoint.node_id(),
                descriptor.node_id
            )));
        }
        self.nodes
            .insert(descriptor.node_id.clone(), (descriptor, endpoint));
        Ok(())
    }

    fn resolve(&self, node_id: &FlowNodeId) -> Option<NodeEndpoint> {
        self.nodes.get(node_id).map(|entry| entry.value().1.clone())
    }

    fn resolve_all(&self, process_id: &ProcessId) -> Vec<NodeEndpoint> {
        self.entries(process_id)
            .into_iter()
            .map(|(_, endpoint)| endpoint)
            .collect()
    }

    fn descriptors(&self, process_id: &ProcessId) -> Vec<NodeDescriptor> {
        self.entries(process_id)
            .into_iter()
            .map(|(descriptor, _)| descriptor)
            .collect()
    }

    fn remove_process(&self, process_id: &ProcessId) -> Vec<NodeEndpoint> {
        let ids: Vec<FlowNodeId> = self
            .entries(process_id)
            .into_iter()
            .map(|(descriptor, _)| descriptor.node_id)
            .collect();
        ids.iter()
            .filter_map(|id| self.nodes.remove(id).map(|(_, (_, endpoint))| endpoint))
            .collect()
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}
