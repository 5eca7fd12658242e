use async_trait::async_trait;
use mockall::mock;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use procgraph_core::graph::memory::InMemoryGraphStore;
use procgraph_core::graph::{Relationship, VertexProperties};
use procgraph_core::identity::{self, is_archived};
use procgraph_core::{
    CoreError, EngineConfig, EventDefinitionSpec, FlowNodeDefinition, GraphBuilder, GraphStore,
    GraphStoreError, InMemoryNodeRegistry, NodeRegistry, ProcessDefinition, RelationKind, Vertex,
    VertexKey, VertexKind,
};

mock! {
    pub Store {}

    #[async_trait]
    impl GraphStore for Store {
        async fn get_or_create(&self, key: &VertexKey, properties: VertexProperties) -> Result<Vertex, GraphStoreError>;
        async fn save(&self, vertex: &Vertex) -> Result<(), GraphStoreError>;
        async fn add_relationship(&self, from: &VertexKey, to: &VertexKey, kind: RelationKind) -> Result<(), GraphStoreError>;
    }
}

fn order_process() -> ProcessDefinition {
    let review = FlowNodeDefinition::new("review", "subProcess")
        .with_node(FlowNodeDefinition::new("review_start", "startEvent"))
        .with_node(FlowNodeDefinition::new("check", "userTask"))
        .with_node(FlowNodeDefinition::new("review_end", "endEvent"))
        .with_flow("r1", "review_start", "check")
        .with_flow("r2", "check", "review_end");

    ProcessDefinition::new("order", "1")
        .with_node(FlowNodeDefinition::new("start", "startEvent"))
        .with_node(FlowNodeDefinition::new("fork", "parallelGateway"))
        .with_node(FlowNodeDefinition::new("bill", "serviceTask"))
        .with_node(review)
        .with_node(FlowNodeDefinition::new("join", "parallelGateway"))
        .with_node(
            FlowNodeDefinition::new("end", "endEvent")
                .with_event_definition(EventDefinitionSpec::Terminate),
        )
        .with_flow("f1", "start", "fork")
        .with_flow("f2", "fork", "bill")
        .with_flow("f3", "fork", "review")
        .with_flow("f4", "bill", "join")
        .with_flow("f5", "review", "join")
        .with_flow("f6", "join", "end")
}

fn builder_with(
    store: Arc<dyn GraphStore>,
) -> (GraphBuilder, Arc<InMemoryNodeRegistry>) {
    let registry = Arc::new(InMemoryNodeRegistry::new());
    let (transitions, _) = broadcast::channel(64);
    let builder = GraphBuilder::new(store, registry.clone(), EngineConfig::default(), transitions);
    (builder, registry)
}

#[tokio::test]
async fn test_build_is_idempotent() {
    let store = InMemoryGraphStore::new();
    let (builder, registry) = builder_with(Arc::new(store.clone()));
    let definition = order_process();

    let first = builder.build_process("acme", &definition).await.unwrap();
    let vertices = store.vertex_count().await;
    let relationships = store.relationships().await;
    let services = registry.len();

    let second = builder.build_process("acme", &definition).await.unwrap();

    assert_eq!(first.process_id, second.process_id);
    assert_eq!(first.running.graph_id, second.running.graph_id);
    assert_eq!(store.vertex_count().await, vertices);
    assert_eq!(store.relationships().await, relationships);
    assert_eq!(registry.len(), services);

    // root, client, running root, archive root, 2 processes, 9 nodes twice
    assert_eq!(vertices, 6 + 18);
    assert_eq!(services, 9);
}

#[tokio::test]
async fn test_running_and_archive_graphs_are_isomorphic() {
    let store = InMemoryGraphStore::new();
    let (builder, _registry) = builder_with(Arc::new(store.clone()));
    builder.build_process("acme", &order_process()).await.unwrap();

    let flow_nodes = store.vertices_of_kind(VertexKind::FlowNode).await;
    let (archive, running): (Vec<Vertex>, Vec<Vertex>) = flow_nodes
        .into_iter()
        .partition(|v| is_archived(&v.key.natural_key));

    let kinds = |vertices: &[Vertex]| {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for vertex in vertices {
            *counts
                .entry(vertex.property_str("kind").unwrap_or_default().to_string())
                .or_default() += 1;
        }
        counts
    };
    assert_eq!(kinds(&running), kinds(&archive));

    // No id is shared between the two graphs
    for vertex in &running {
        assert!(archive.iter().all(|a| a.key.natural_key != vertex.key.natural_key));
    }

    let strip = |key: &VertexKey| {
        key.natural_key
            .strip_prefix(identity::ARCHIVE_PREFIX)
            .unwrap_or(&key.natural_key)
            .to_string()
    };
    for kind in [RelationKind::FollowedBy, RelationKind::HasSubProcessNode] {
        let edges = store.relationships_of_kind(kind).await;
        let mut running_edges: Vec<(String, String)> = Vec::new();
        let mut archive_edges: Vec<(String, String)> = Vec::new();
        for Relationship { from, to, .. } in &edges {
            if is_archived(&from.natural_key) {
                assert!(is_archived(&to.natural_key), "edge crosses graphs");
                archive_edges.push((strip(from), strip(to)));
            } else {
                running_edges.push((from.natural_key.clone(), to.natural_key.clone()));
            }
        }
        running_edges.sort();
        archive_edges.sort();
        assert_eq!(running_edges, archive_edges);
        assert!(!running_edges.is_empty());
    }

    assert_eq!(
        store.relationships_of_kind(RelationKind::FollowedBy).await.len(),
        2 * 8
    );
}

#[tokio::test]
async fn test_dangling_target_is_rejected_without_side_effects() {
    let store = InMemoryGraphStore::new();
    let (builder, registry) = builder_with(Arc::new(store.clone()));
    let definition = ProcessDefinition::new("broken", "1")
        .with_node(FlowNodeDefinition::new("start", "startEvent"))
        .with_node(FlowNodeDefinition::new("task", "task"))
        .with_flow("f1", "start", "task")
        .with_flow("f2", "task", "nowhere");

    let err = builder.build_process("acme", &definition).await.unwrap_err();

    assert!(matches!(err, CoreError::ConfigurationError(_)));
    assert_eq!(store.vertex_count().await, 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_unknown_node_kind_fails_the_whole_build() {
    let store = InMemoryGraphStore::new();
    let (builder, registry) = builder_with(Arc::new(store.clone()));
    let nested = FlowNodeDefinition::new("sub", "subProcess")
        .with_node(FlowNodeDefinition::new("weird", "complexGateway"));
    let definition = ProcessDefinition::new("odd", "1")
        .with_node(FlowNodeDefinition::new("start", "startEvent"))
        .with_node(nested);

    let err = builder.build_process("acme", &definition).await.unwrap_err();

    assert!(matches!(err, CoreError::ConfigurationError(ref m) if m.contains("weird")));
    assert_eq!(store.vertex_count().await, 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_store_failure_surfaces_as_persistence_conflict() {
    let mut store = MockStore::new();
    store
        .expect_get_or_create()
        .returning(|key, properties| match key.kind {
            VertexKind::FlowNode => Err(GraphStoreError::ConstraintViolation(format!(
                "duplicate {}",
                key.natural_key
            ))),
            _ => Ok(Vertex::new(key.clone(), properties)),
        });
    store.expect_add_relationship().returning(|_, _, _| Ok(()));
    store.expect_save().never();

    let (builder, registry) = builder_with(Arc::new(store));
    let err = builder
        .build_process("acme", &order_process())
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::PersistenceConflict(ref m) if m.contains("duplicate")));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_rebuild_after_partial_failure_completes() {
    // First attempt dies after the process vertices; a rerun against the same
    // store fills in the rest
    let store = InMemoryGraphStore::new();
    let mut failing = MockStore::new();
    let backing = store.clone();
    failing
        .expect_get_or_create()
        .returning(move |key, properties| match key.kind {
            VertexKind::FlowNode => Err(GraphStoreError::ConnectionError("lost".to_string())),
            _ => futures::executor::block_on(backing.get_or_create(key, properties)),
        });
    let backing = store.clone();
    failing
        .expect_add_relationship()
        .returning(move |from, to, kind| {
            futures::executor::block_on(backing.add_relationship(from, to, kind))
        });

    let (first, _) = builder_with(Arc::new(failing));
    assert!(first.build_process("acme", &order_process()).await.is_err());
    let partial = store.vertex_count().await;
    assert_eq!(partial, 6);

    let (second, registry) = builder_with(Arc::new(store.clone()));
    second.build_process("acme", &order_process()).await.unwrap();
    assert_eq!(store.vertex_count().await, 6 + 18);
    assert_eq!(registry.len(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_builds_match_a_single_build() {
    let reference = InMemoryGraphStore::new();
    let (single, _) = builder_with(Arc::new(reference.clone()));
    single.build_process("acme", &order_process()).await.unwrap();

    let store = InMemoryGraphStore::new();
    let (builder, registry) = builder_with(Arc::new(store.clone()));
    let builder = Arc::new(builder);
    let builds = (0..16).map(|_| {
        let builder = builder.clone();
        tokio::spawn(async move { builder.build_process("acme", &order_process()).await })
    });
    let results = futures::future::join_all(builds).await;

    let mut process_ids = Vec::new();
    for result in results {
        process_ids.push(result.unwrap().unwrap().process_id);
    }
    process_ids.dedup();
    assert_eq!(process_ids.len(), 1);

    assert_eq!(store.vertex_count().await, reference.vertex_count().await);
    assert_eq!(store.relationships().await, reference.relationships().await);
    assert_eq!(registry.len(), 9);
    for endpoint in registry.resolve_all(&process_ids[0]) {
        assert!(!endpoint.is_closed(), "{} is not running", endpoint.node_id());
    }
}
