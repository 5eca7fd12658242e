//! Node-kind specific behavior behind the activation protocol.
//!
//! A node service holds exactly one [`EventDefinition`], chosen by
//! [`create_event_definition`] when the process is built.

mod catch;
mod empty;
mod parallel_join;
mod sub_process;
mod terminate;
mod timer;

pub use catch::MessageCatchEventDefinition;
pub use empty::EmptyEventDefinition;
pub use parallel_join::ParallelJoinEventDefinition;
pub use sub_process::SubProcessEventDefinition;
pub use terminate::{TerminateEventDefinition, TerminationReport};
pub use timer::TimerEventDefinition;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::endpoint::NodeEndpoint;
use super::messages::{
    ActivationMessage, CommitError, DeactivationMessage, NodeState, TriggerMessage,
};
use super::node_service::NodeBlueprint;
use super::registry::NodeRegistry;
use crate::config::EngineConfig;
use crate::definition::{EventDefinitionSpec, NodeKind};
use crate::error::CoreError;
use crate::identity::{FlowNodeId, ProcessId};

/// What the owning node service does after a successful operation
#[derive(Debug, Clone)]
pub enum Continuation {
    /// Activate every outgoing sequence-flow target with the payload
    Proceed(Option<Value>),
    /// Activate the embedded entry nodes first, then the outgoing targets
    Descend {
        entry_points: Vec<NodeEndpoint>,
        payload: Option<Value>,
    },
    /// Stay active until a trigger arrives
    Await,
    /// Finish for this instance without touching outgoing flows
    Complete(Option<Value>),
    /// Acknowledge without any state change
    Unchanged(Option<Value>),
}

/// Identity and settings of the node a definition runs inside
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node_id: FlowNodeId,
    pub process_id: ProcessId,
    pub kind: NodeKind,
    /// The node's own mailbox
    pub endpoint: NodeEndpoint,
    pub config: EngineConfig,
}

#[async_trait]
pub trait EventDefinition: Send + Sync {
    fn name(&self) -> &'static str;

    async fn activate(
        &self,
        ctx: &NodeContext,
        message: &ActivationMessage,
        deadline: Instant,
    ) -> Result<Continuation, CommitError>;

    /// Release instance-local state; the node leaves Active regardless of the result
    async fn deactivate(
        &self,
        ctx: &NodeContext,
        message: &DeactivationMessage,
        deadline: Instant,
    ) -> Result<(), CommitError>;

    async fn trigger(
        &self,
        ctx: &NodeContext,
        message: &TriggerMessage,
        state: NodeState,
        deadline: Instant,
    ) -> Result<Continuation, CommitError>;
}

/// Select the event definition for a node.
///
/// Every endpoint the definition addresses must already be registered.
pub fn create_event_definition(
    blueprint: &NodeBlueprint,
    endpoint: &NodeEndpoint,
    registry: &dyn NodeRegistry,
    config: &EngineConfig,
) -> Result<Arc<dyn EventDefinition>, CoreError> {
    let descriptor = &blueprint.descriptor;
    let definition: Arc<dyn EventDefinition> = match descriptor.kind {
        NodeKind::StartEvent | NodeKind::EndEvent | NodeKind::Task => {
            Arc::new(EmptyEventDefinition)
        }
        NodeKind::ParallelGateway if blueprint.incoming > 1 => {
            Arc::new(ParallelJoinEventDefinition::new(blueprint.incoming))
        }
        NodeKind::ParallelGateway => Arc::new(EmptyEventDefinition),
        NodeKind::ReceiveTask | NodeKind::MessageCatchEvent => {
            let reference = match &blueprint.event_definition {
                Some(EventDefinitionSpec::Message { message_ref }) => Some(message_ref.clone()),
                Some(EventDefinitionSpec::Signal { signal_ref }) => Some(signal_ref.clone()),
                _ => None,
            };
            Arc::new(MessageCatchEventDefinition::new(reference))
        }
        NodeKind::TimerCatchEvent => match &blueprint.event_definition {
            Some(EventDefinitionSpec::Timer { duration_ms }) => {
                Arc::new(TimerEventDefinition::new(Duration::from_millis(*duration_ms)))
            }
            other => {
                return Err(CoreError::ConfigurationError(format!(
                    "timer node '{}' has no timer definition: {:?}",
                    descriptor.local_id, other
                )))
            }
        },
        NodeKind::SubProcess => {
            let entry_points = blueprint
                .embedded_entries
                .iter()
                .map(|node_id| {
                    registry.resolve(node_id).ok_or_else(|| {
                        CoreError::RegistryError(format!(
                            "embedded entry {} of sub-process '{}' is not registered",
                            node_id, descriptor.local_id
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(SubProcessEventDefinition::new(entry_points))
        }
        NodeKind::TerminateEndEvent => Arc::new(TerminateEventDefinition::new(
            descriptor.process_id.clone(),
            descriptor.node_id.clone(),
            endpoint.clone(),
            registry.resolve_all(&descriptor.process_id),
            config,
        )),
    };
    Ok(definition)
}
