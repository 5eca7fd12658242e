//! Materializes a process definition into the running and archive graphs and
//! starts one node service per flow node.
//!
//! Every vertex is addressed by a deterministic natural key and created with
//! get-or-create, so a build can be repeated after a crash or restart and only
//! fills in what is missing.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use super::entities::{RelationKind, Vertex, VertexKey, VertexKind, VertexProperties};
use super::store::GraphStore;
use crate::config::EngineConfig;
use crate::definition::{partition, FlowElement, NodeKind, ProcessDefinition};
use crate::error::CoreError;
use crate::identity::{self, FlowNodeId, ProcessId, SubProcessPath};
use crate::runtime::event_definition::{create_event_definition, NodeContext};
use crate::runtime::messages::{Envelope, NodeTransition};
use crate::runtime::node_service::{NodeBlueprint, NodeService};
use crate::runtime::registry::{NodeDescriptor, NodeRegistry};
use crate::runtime::NodeEndpoint;

/// Natural key of the single graph root
pub const ROOT_KEY: &str = "root";

/// Process vertices produced by a build
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRoots {
    pub process_id: ProcessId,
    pub running: Vertex,
    pub archive: Vertex,
}

/// Where the nodes of one nesting level hang in both graphs
#[derive(Debug, Clone)]
struct LevelParent {
    running: VertexKey,
    archive: VertexKey,
    relation: RelationKind,
    node_id: Option<FlowNodeId>,
}

/// A node of the level currently being materialized
struct LevelNode {
    running: Vertex,
    archive: Vertex,
}

struct BuildScope<'a> {
    client_id: &'a str,
    process_id: &'a ProcessId,
}

pub struct GraphBuilder {
    store: Arc<dyn GraphStore>,
    registry: Arc<dyn NodeRegistry>,
    config: EngineConfig,
    transitions: broadcast::Sender<NodeTransition>,
    /// Serializes every build; never held across registry calls
    build_lock: Mutex<()>,
    /// Serializes the check-then-register step for node services
    registry_lock: Mutex<()>,
}

impl GraphBuilder {
    pub fn new(
        store: Arc<dyn GraphStore>,
        registry: Arc<dyn NodeRegistry>,
        config: EngineConfig,
        transitions: broadcast::Sender<NodeTransition>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            transitions,
            build_lock: Mutex::new(()),
            registry_lock: Mutex::new(()),
        }
    }

    /// Build (or rebuild) the graphs and node services for a definition.
    ///
    /// The definition is validated before anything is written, so a
    /// configuration error leaves both the store and the registry untouched.
    #[instrument(
        skip(self, client_id, definition),
        fields(client_id = %client_id, definition_id = %definition.id, version = %definition.version)
    )]
    pub async fn build_process(
        &self,
        client_id: &str,
        definition: &ProcessDefinition,
    ) -> Result<ProcessRoots, CoreError> {
        definition.validate()?;
        let process_id = identity::process_id(client_id, &definition.id, &definition.version);

        let (roots, blueprints) = {
            let _guard = self.build_lock.lock().await;
            self.materialize(client_id, &process_id, definition)
                .await
                .map_err(|err| {
                    error!(process_id = %process_id, error = %err, "Materializing process failed");
                    err
                })?
        };

        let started = self.spawn_node_services(&process_id, blueprints).await?;
        info!(
            process_id = %process_id,
            node_services_started = started,
            "Process built"
        );
        Ok(roots)
    }

    async fn materialize(
        &self,
        client_id: &str,
        process_id: &ProcessId,
        definition: &ProcessDefinition,
    ) -> Result<(ProcessRoots, Vec<NodeBlueprint>), CoreError> {
        let root = self
            .store
            .get_or_create(&VertexKey::new(VertexKind::Root, ROOT_KEY), properties(&[]))
            .await?;
        let client = self
            .store
            .get_or_create(
                &VertexKey::new(VertexKind::Client, client_id),
                properties(&[("client_id", json!(client_id))]),
            )
            .await?;
        let running_root = self
            .store
            .get_or_create(
                &VertexKey::new(VertexKind::RunningRoot, client_id),
                properties(&[("client_id", json!(client_id))]),
            )
            .await?;
        let archive_root = self
            .store
            .get_or_create(
                &VertexKey::new(VertexKind::ArchiveRoot, client_id),
                properties(&[("client_id", json!(client_id))]),
            )
            .await?;

        self.link(&root.key, &client.key, RelationKind::HasClient).await?;
        self.link(&client.key, &running_root.key, RelationKind::HasRunningRoot)
            .await?;
        self.link(&client.key, &archive_root.key, RelationKind::HasArchiveRoot)
            .await?;

        let archive_process_id = identity::archived(process_id.as_str());
        let mut running = self
            .store
            .get_or_create(
                &VertexKey::new(VertexKind::Process, process_id.as_str()),
                process_properties(client_id, process_id.as_str(), definition, false),
            )
            .await?;
        let mut archive = self
            .store
            .get_or_create(
                &VertexKey::new(VertexKind::Process, archive_process_id.as_str()),
                process_properties(client_id, &archive_process_id, definition, true),
            )
            .await?;
        debug!(process_id = %process_id, "Process vertices ready");

        self.link(&running_root.key, &running.key, RelationKind::HasProcess)
            .await?;
        self.link(&archive_root.key, &archive.key, RelationKind::HasProcess)
            .await?;

        let scope = BuildScope {
            client_id,
            process_id,
        };
        let parent = LevelParent {
            running: running.key.clone(),
            archive: archive.key.clone(),
            relation: RelationKind::HasFlowNode,
            node_id: None,
        };
        let mut blueprints = Vec::new();
        self.materialize_level(
            &scope,
            &definition.flow_elements,
            SubProcessPath::root(),
            &parent,
            &mut blueprints,
        )
        .await?;

        let node_count = json!(blueprints.len());
        running.properties.insert("flow_node_count".to_string(), node_count.clone());
        archive.properties.insert("flow_node_count".to_string(), node_count);
        self.store.save(&running).await?;
        self.store.save(&archive).await?;

        Ok((
            ProcessRoots {
                process_id: process_id.clone(),
                running,
                archive,
            },
            blueprints,
        ))
    }

    /// Materialize one nesting level, recursing into sub-processes
    fn materialize_level<'a>(
        &'a self,
        scope: &'a BuildScope<'a>,
        elements: &'a [FlowElement],
        path: SubProcessPath,
        parent: &'a LevelParent,
        blueprints: &'a mut Vec<NodeBlueprint>,
    ) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            let (nodes, flows) = partition(elements);

            let mut outgoing: HashMap<&str, Vec<FlowNodeId>> = HashMap::new();
            let mut incoming: HashMap<&str, usize> = HashMap::new();
            for flow in &flows {
                outgoing.entry(flow.source_ref.as_str()).or_default().push(
                    identity::flow_node_id(scope.client_id, scope.process_id, &path, &flow.target_ref),
                );
                *incoming.entry(flow.target_ref.as_str()).or_default() += 1;
            }

            let mut level: HashMap<&str, LevelNode> = HashMap::new();
            for node in nodes {
                let kind = NodeKind::resolve(node)?;
                let node_id =
                    identity::flow_node_id(scope.client_id, scope.process_id, &path, &node.id);
                let archive_id = identity::archived(node_id.as_str());

                let running = self
                    .store
                    .get_or_create(
                        &VertexKey::new(VertexKind::FlowNode, node_id.as_str()),
                        node_properties(node_id.as_str(), &node.id, node.name.as_deref(), kind, &path, false),
                    )
                    .await?;
                let archive = self
                    .store
                    .get_or_create(
                        &VertexKey::new(VertexKind::FlowNode, archive_id.as_str()),
                        node_properties(&archive_id, &node.id, node.name.as_deref(), kind, &path, true),
                    )
                    .await?;
                self.link(&parent.running, &running.key, parent.relation).await?;
                self.link(&parent.archive, &archive.key, parent.relation).await?;
                debug!(
                    node_id = %node_id,
                    local_id = %node.id,
                    kind = %kind,
                    depth = path.depth(),
                    "Flow node materialized"
                );

                let mut embedded_entries = Vec::new();
                if kind == NodeKind::SubProcess {
                    let child_path = path.child(&node.id);
                    embedded_entries = entry_nodes(&node.flow_elements)
                        .into_iter()
                        .map(|local| {
                            identity::flow_node_id(scope.client_id, scope.process_id, &child_path, local)
                        })
                        .collect();
                    let child_parent = LevelParent {
                        running: running.key.clone(),
                        archive: archive.key.clone(),
                        relation: RelationKind::HasSubProcessNode,
                        node_id: Some(node_id.clone()),
                    };
                    self.materialize_level(scope, &node.flow_elements, child_path, &child_parent, blueprints)
                        .await?;
                }

                blueprints.push(NodeBlueprint {
                    descriptor: NodeDescriptor {
                        node_id: node_id.clone(),
                        process_id: scope.process_id.clone(),
                        local_id: node.id.clone(),
                        kind,
                        parent: parent.node_id.clone(),
                        path: path.clone(),
                    },
                    outgoing: outgoing.remove(node.id.as_str()).unwrap_or_default(),
                    incoming: incoming.get(node.id.as_str()).copied().unwrap_or(0),
                    embedded_entries,
                    event_definition: node.event_definition.clone(),
                });
                level.insert(node.id.as_str(), LevelNode { running, archive });
            }

            for flow in &flows {
                let (source, target) = match (
                    level.get(flow.source_ref.as_str()),
                    level.get(flow.target_ref.as_str()),
                ) {
                    (Some(source), Some(target)) => (source, target),
                    _ => {
                        return Err(CoreError::ConfigurationError(format!(
                            "sequence flow '{}' references a node outside its scope",
                            flow.id
                        )))
                    }
                };
                self.link(&source.running.key, &target.running.key, RelationKind::FollowedBy)
                    .await?;
                self.link(&source.archive.key, &target.archive.key, RelationKind::FollowedBy)
                    .await?;
            }

            for node in level.values() {
                self.store.save(&node.running).await?;
                self.store.save(&node.archive).await?;
            }
            Ok(())
        })
    }

    async fn link(
        &self,
        from: &VertexKey,
        to: &VertexKey,
        kind: RelationKind,
    ) -> Result<(), CoreError> {
        self.store.add_relationship(from, to, kind).await?;
        Ok(())
    }

    /// Make sure every node of a process has a running node service.
    ///
    /// Node services hold the endpoints of their neighbours, so when any node
    /// lacks a live service the whole process is restarted on fresh endpoints;
    /// otherwise nothing changes. All endpoints are registered before any
    /// event definition is created, so definitions addressing other nodes of
    /// the process can resolve them.
    async fn spawn_node_services(
        &self,
        process_id: &ProcessId,
        blueprints: Vec<NodeBlueprint>,
    ) -> Result<usize, CoreError> {
        let (replaced, assembled) = {
            let _guard = self.registry_lock.lock().await;
            let live: Vec<NodeEndpoint> = blueprints
                .iter()
                .filter_map(|blueprint| self.registry.resolve(&blueprint.descriptor.node_id))
                .filter(|endpoint| !endpoint.is_closed())
                .collect();
            if live.len() == blueprints.len() {
                debug!(process_id = %process_id, "Every node service is running");
                return Ok(0);
            }
            if !live.is_empty() {
                warn!(
                    process_id = %process_id,
                    running = live.len(),
                    expected = blueprints.len(),
                    "Restarting node services of a partially running process"
                );
            }
            (live, self.assemble_services(blueprints))
        };

        for endpoint in &replaced {
            if endpoint.stop().await.is_err() {
                debug!(node_id = %endpoint.node_id(), "Replaced node service already gone");
            }
        }

        let services = assembled?;
        let started = services.len();
        // Nothing starts unless every service could be assembled
        for service in services {
            service.spawn();
        }
        Ok(started)
    }

    /// Register a fresh endpoint for every blueprint and build its node service
    fn assemble_services(&self, blueprints: Vec<NodeBlueprint>) -> Result<Vec<NodeService>, CoreError> {
        let mut fresh: Vec<(NodeBlueprint, NodeEndpoint, mpsc::Receiver<Envelope>)> =
            Vec::with_capacity(blueprints.len());
        for blueprint in blueprints {
            let (endpoint, mailbox) =
                NodeEndpoint::channel(blueprint.descriptor.node_id.clone(), self.config.mailbox_capacity);
            self.registry
                .register(blueprint.descriptor.clone(), endpoint.clone())?;
            fresh.push((blueprint, endpoint, mailbox));
        }

        let mut services = Vec::with_capacity(fresh.len());
        for (blueprint, endpoint, mailbox) in fresh {
            let event_definition =
                create_event_definition(&blueprint, &endpoint, self.registry.as_ref(), &self.config)?;
            let outgoing = blueprint
                .outgoing
                .iter()
                .map(|target| {
                    self.registry.resolve(target).ok_or_else(|| {
                        CoreError::RegistryError(format!("sequence flow target {} is not registered", target))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let descriptor = blueprint.descriptor;
            let context = NodeContext {
                node_id: descriptor.node_id,
                process_id: descriptor.process_id,
                kind: descriptor.kind,
                endpoint,
                config: self.config.clone(),
            };
            services.push(NodeService::new(
                context,
                event_definition,
                outgoing,
                mailbox,
                self.transitions.clone(),
            ));
        }
        Ok(services)
    }
}

/// Local ids of the nodes a sub-process starts with: its start events, or
/// every node without an incoming flow when it has none
fn entry_nodes(elements: &[FlowElement]) -> Vec<&str> {
    let (nodes, flows) = partition(elements);
    let starts: Vec<&str> = nodes
        .iter()
        .filter(|node| matches!(NodeKind::resolve(node), Ok(NodeKind::StartEvent)))
        .map(|node| node.id.as_str())
        .collect();
    if !starts.is_empty() {
        return starts;
    }
    nodes
        .iter()
        .filter(|node| !flows.iter().any(|flow| flow.target_ref == node.id))
        .map(|node| node.id.as_str())
        .collect()
}

fn properties(pairs: &[(&str, Value)]) -> VertexProperties {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn process_properties(
    client_id: &str,
    id: &str,
    definition: &ProcessDefinition,
    archived: bool,
) -> VertexProperties {
    properties(&[
        ("process_id", json!(id)),
        ("client_id", json!(client_id)),
        ("definition_id", json!(definition.id)),
        ("version", json!(definition.version)),
        ("name", json!(definition.name)),
        ("archived", json!(archived)),
    ])
}

fn node_properties(
    id: &str,
    local_id: &str,
    name: Option<&str>,
    kind: NodeKind,
    path: &SubProcessPath,
    archived: bool,
) -> VertexProperties {
    properties(&[
        ("flow_node_id", json!(id)),
        ("local_id", json!(local_id)),
        ("name", json!(name)),
        ("kind", json!(kind.as_str())),
        ("path", json!(path.segments())),
        ("archived", json!(archived)),
    ])
}
