//! In-process entry point tying the builder, the registry and the node services together.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::definition::{NodeKind, ProcessDefinition};
use crate::error::CoreError;
use crate::graph::{GraphBuilder, GraphStore, ProcessRoots};
use crate::identity::{FlowNodeId, ProcessId};
use crate::runtime::{
    activate_all, Commit, DeactivationMessage, InMemoryNodeRegistry, NodeEndpoint, NodeRegistry,
    NodeState, NodeTransition, ProcessInstanceId, TriggerMessage,
};

pub struct ProcessEngine {
    config: EngineConfig,
    builder: GraphBuilder,
    registry: Arc<dyn NodeRegistry>,
    transitions: broadcast::Sender<NodeTransition>,
}

impl ProcessEngine {
    /// Engine with an in-memory node registry
    pub fn new(config: EngineConfig, store: Arc<dyn GraphStore>) -> Result<Self, CoreError> {
        Self::with_registry(config, store, Arc::new(InMemoryNodeRegistry::new()))
    }

    pub fn with_registry(
        config: EngineConfig,
        store: Arc<dyn GraphStore>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let (transitions, _) = broadcast::channel(config.transition_buffer);
        let builder = GraphBuilder::new(store, registry.clone(), config.clone(), transitions.clone());
        Ok(Self {
            config,
            builder,
            registry,
            transitions,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<dyn NodeRegistry> {
        self.registry.clone()
    }

    /// Node state transitions of every node service this engine started
    pub fn subscribe(&self) -> broadcast::Receiver<NodeTransition> {
        self.transitions.subscribe()
    }

    /// Build the graphs and node services for a definition; safe to repeat
    pub async fn deploy(
        &self,
        client_id: &str,
        definition: &ProcessDefinition,
    ) -> Result<ProcessRoots, CoreError> {
        self.builder.build_process(client_id, definition).await
    }

    /// Start a new instance by activating every top-level start node
    pub async fn start_instance(
        &self,
        process_id: &ProcessId,
        payload: Option<Value>,
    ) -> Result<(ProcessInstanceId, Commit), CoreError> {
        let instance_id = ProcessInstanceId::new();
        let commit = self
            .start_instance_with_id(process_id, &instance_id, payload)
            .await?;
        Ok((instance_id, commit))
    }

    #[instrument(
        skip(self, process_id, instance_id, payload),
        fields(process_id = %process_id, instance_id = %instance_id)
    )]
    pub async fn start_instance_with_id(
        &self,
        process_id: &ProcessId,
        instance_id: &ProcessInstanceId,
        payload: Option<Value>,
    ) -> Result<Commit, CoreError> {
        let descriptors = self.registry.descriptors(process_id);
        if descriptors.is_empty() {
            return Err(CoreError::ConfigurationError(format!(
                "process {} is not deployed",
                process_id
            )));
        }

        let entry_points: Vec<NodeEndpoint> = descriptors
            .iter()
            .filter(|d| d.is_top_level() && d.kind == NodeKind::StartEvent)
            .filter_map(|d| self.registry.resolve(&d.node_id))
            .collect();
        let first = match entry_points.first() {
            Some(endpoint) => endpoint.node_id().clone(),
            None => {
                return Err(CoreError::ConfigurationError(format!(
                    "process {} has no start event",
                    process_id
                )))
            }
        };

        info!(entry_points = entry_points.len(), "Starting process instance");
        let deadline = self.deadline();
        let commit = if entry_points.len() == 1 {
            entry_points[0]
                .activate_instance(instance_id, payload, deadline)
                .await
        } else {
            activate_all(&entry_points, instance_id, payload.clone(), deadline)
                .await
                .into_commit(instance_id, &first, payload)
        };

        if !commit.ok {
            warn!(error = ?commit.error, "Process instance start failed");
        }
        Ok(commit)
    }

    /// Deliver a trigger to one node of an instance
    pub async fn trigger(
        &self,
        node_id: &FlowNodeId,
        instance_id: &ProcessInstanceId,
        payload: Option<Value>,
    ) -> Result<Commit, CoreError> {
        let endpoint = self.endpoint(node_id)?;
        let message = TriggerMessage {
            instance_id: instance_id.clone(),
            payload,
        };
        Ok(endpoint.trigger(message, self.deadline()).await)
    }

    pub async fn deactivate(
        &self,
        node_id: &FlowNodeId,
        instance_id: &ProcessInstanceId,
    ) -> Result<Commit, CoreError> {
        let endpoint = self.endpoint(node_id)?;
        let message = DeactivationMessage {
            instance_id: instance_id.clone(),
        };
        Ok(endpoint.deactivate(message, self.deadline()).await)
    }

    pub async fn node_state(
        &self,
        node_id: &FlowNodeId,
        instance_id: &ProcessInstanceId,
    ) -> Result<NodeState, CoreError> {
        self.endpoint(node_id)?.state(instance_id).await
    }

    pub fn endpoint(&self, node_id: &FlowNodeId) -> Result<NodeEndpoint, CoreError> {
        self.registry
            .resolve(node_id)
            .ok_or_else(|| CoreError::RegistryError(format!("unknown node {}", node_id)))
    }

    /// Stop and forget every node service of a process; the graphs are kept
    pub async fn teardown(&self, process_id: &ProcessId) -> usize {
        let endpoints = self.registry.remove_process(process_id);
        let mut stopped = 0;
        for endpoint in &endpoints {
            if endpoint.stop().await.is_ok() {
                stopped += 1;
            }
        }
        info!(process_id = %process_id, stopped, "Process torn down");
        stopped
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.operation_timeout()
    }
}
