use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use procgraph::graph::memory::InMemoryGraphStore;
use procgraph::runtime::{NodeState, NodeTransition, TerminationReport};
use procgraph::{
    CommitErrorKind, CoreError, EngineConfig, EventDefinitionSpec, FlowNodeDefinition, FlowNodeId,
    NodeRegistry, ProcessDefinition, ProcessEngine, ProcessRoots,
};

fn engine() -> ProcessEngine {
    ProcessEngine::new(EngineConfig::default(), Arc::new(InMemoryGraphStore::new())).unwrap()
}

fn node(engine: &ProcessEngine, roots: &ProcessRoots, local_id: &str) -> FlowNodeId {
    engine
        .registry()
        .descriptors(&roots.process_id)
        .into_iter()
        .find(|d| d.local_id == local_id)
        .map(|d| d.node_id)
        .unwrap_or_else(|| panic!("no node {}", local_id))
}

fn terminate_end(id: &str) -> FlowNodeDefinition {
    FlowNodeDefinition::new(id, "endEvent").with_event_definition(EventDefinitionSpec::Terminate)
}

fn drain(receiver: &mut tokio::sync::broadcast::Receiver<NodeTransition>) -> Vec<NodeTransition> {
    let mut seen = Vec::new();
    while let Ok(transition) = receiver.try_recv() {
        seen.push(transition);
    }
    seen
}

#[tokio::test]
async fn test_activation_flows_along_sequence() {
    let engine = engine();
    let mut transitions = engine.subscribe();
    let definition = ProcessDefinition::new("pair", "1")
        .with_node(FlowNodeDefinition::new("a", "startEvent"))
        .with_node(FlowNodeDefinition::new("b", "endEvent"))
        .with_flow("f", "a", "b");

    let roots = engine.deploy("acme", &definition).await.unwrap();
    let (instance, commit) = engine.start_instance(&roots.process_id, None).await.unwrap();
    assert!(commit.ok, "{:?}", commit.error);

    let a = node(&engine, &roots, "a");
    let b = node(&engine, &roots, "b");
    assert_eq!(engine.node_state(&a, &instance).await.unwrap(), NodeState::Inactive);
    assert_eq!(engine.node_state(&b, &instance).await.unwrap(), NodeState::Inactive);

    let activated: Vec<FlowNodeId> = drain(&mut transitions)
        .into_iter()
        .filter(|t| t.to == NodeState::Active && t.instance_id == instance)
        .map(|t| t.node_id)
        .collect();
    assert_eq!(activated, vec![a, b]);
}

#[tokio::test]
async fn test_receive_task_completes_on_trigger() {
    let engine = engine();
    let definition = ProcessDefinition::new("payment", "1")
        .with_node(FlowNodeDefinition::new("start", "startEvent"))
        .with_node(FlowNodeDefinition::new("wait", "receiveTask"))
        .with_node(FlowNodeDefinition::new("end", "endEvent"))
        .with_flow("f1", "start", "wait")
        .with_flow("f2", "wait", "end");
    let roots = engine.deploy("acme", &definition).await.unwrap();
    let wait = node(&engine, &roots, "wait");

    let (instance, commit) = engine.start_instance(&roots.process_id, None).await.unwrap();
    assert!(commit.ok);
    assert_eq!(engine.node_state(&wait, &instance).await.unwrap(), NodeState::Active);

    let commit = engine
        .trigger(&wait, &instance, Some(json!({"paid": true})))
        .await
        .unwrap();
    assert!(commit.ok, "{:?}", commit.error);
    assert_eq!(commit.payload, Some(json!({"paid": true})));
    assert_eq!(engine.node_state(&wait, &instance).await.unwrap(), NodeState::Inactive);

    // A second trigger finds nothing to complete
    let commit = engine.trigger(&wait, &instance, None).await.unwrap();
    assert_eq!(commit.error_kind(), Some(CommitErrorKind::ProtocolViolation));
}

#[tokio::test]
async fn test_terminate_reached_through_sub_process() {
    let engine = engine();
    let sub = FlowNodeDefinition::new("S", "subProcess")
        .with_node(FlowNodeDefinition::new("s1", "startEvent"))
        .with_node(FlowNodeDefinition::new("r", "receiveTask"))
        .with_flow("sf", "s1", "r");
    let definition = ProcessDefinition::new("nested", "1")
        .with_node(FlowNodeDefinition::new("start", "startEvent"))
        .with_node(sub)
        .with_node(terminate_end("T"))
        .with_flow("f1", "start", "S")
        .with_flow("f2", "S", "T");

    let roots = engine.deploy("acme", &definition).await.unwrap();
    let started = Instant::now();
    let (instance, commit) = engine.start_instance(&roots.process_id, None).await.unwrap();

    assert!(commit.ok, "{:?}", commit.error);
    assert!(started.elapsed() < Duration::from_secs(1));
    for local in ["start", "S", "s1", "r", "T"] {
        let id = node(&engine, &roots, local);
        assert_eq!(
            engine.node_state(&id, &instance).await.unwrap(),
            NodeState::Inactive,
            "{} still active",
            local
        );
    }
}

fn two_waiting_tasks() -> ProcessDefinition {
    let sub = FlowNodeDefinition::new("S", "subProcess")
        .with_node(FlowNodeDefinition::new("r1", "receiveTask"))
        .with_node(FlowNodeDefinition::new("r2", "receiveTask"));
    ProcessDefinition::new("waiting", "1")
        .with_node(FlowNodeDefinition::new("start", "startEvent"))
        .with_node(sub)
        .with_node(terminate_end("T"))
        .with_flow("f1", "start", "S")
}

#[tokio::test]
async fn test_terminate_deactivates_every_node() {
    let engine = engine();
    let roots = engine.deploy("acme", &two_waiting_tasks()).await.unwrap();
    let (instance, commit) = engine.start_instance(&roots.process_id, None).await.unwrap();
    assert!(commit.ok, "{:?}", commit.error);

    let r1 = node(&engine, &roots, "r1");
    let r2 = node(&engine, &roots, "r2");
    assert_eq!(engine.node_state(&r1, &instance).await.unwrap(), NodeState::Active);
    assert_eq!(engine.node_state(&r2, &instance).await.unwrap(), NodeState::Active);

    let terminate = engine.endpoint(&node(&engine, &roots, "T")).unwrap();
    let commit = terminate
        .activate_instance(&instance, None, Instant::now() + Duration::from_secs(10))
        .await;

    assert!(commit.ok, "{:?}", commit.error);
    let report: TerminationReport = serde_json::from_value(commit.payload.unwrap()).unwrap();
    assert_eq!(report.confirmed.len(), 4);
    assert!(report.failed.is_empty());
    assert!(report.unresponsive.is_empty());
    assert_eq!(engine.node_state(&r1, &instance).await.unwrap(), NodeState::Inactive);
    assert_eq!(engine.node_state(&r2, &instance).await.unwrap(), NodeState::Inactive);
}

#[tokio::test]
async fn test_terminate_reports_stopped_node() {
    let engine = engine();
    let roots = engine.deploy("acme", &two_waiting_tasks()).await.unwrap();
    let (instance, _) = engine.start_instance(&roots.process_id, None).await.unwrap();

    let r2 = node(&engine, &roots, "r2");
    engine.endpoint(&r2).unwrap().stop().await.unwrap();

    let terminate = engine.endpoint(&node(&engine, &roots, "T")).unwrap();
    let commit = terminate
        .activate_instance(&instance, None, Instant::now() + Duration::from_secs(10))
        .await;

    assert!(!commit.ok);
    let error = commit.error.unwrap();
    assert_eq!(error.kind, CommitErrorKind::DeactivationIncomplete);
    assert_eq!(error.nodes, vec![r2.clone()]);
    let report: TerminationReport = serde_json::from_value(error.details.unwrap()).unwrap();
    assert_eq!(report.failed, vec![r2]);
    assert_eq!(report.confirmed.len(), 3);
}

#[tokio::test]
async fn test_every_start_event_is_activated() {
    let engine = engine();
    let mut transitions = engine.subscribe();
    let definition = ProcessDefinition::new("twin-starts", "1")
        .with_node(FlowNodeDefinition::new("web", "startEvent"))
        .with_node(FlowNodeDefinition::new("mail", "startEvent"))
        .with_node(FlowNodeDefinition::new("inbox", "receiveTask"))
        .with_flow("f1", "web", "inbox")
        .with_flow("f2", "mail", "inbox");
    let roots = engine.deploy("acme", &definition).await.unwrap();

    let (instance, commit) = engine.start_instance(&roots.process_id, None).await.unwrap();
    assert!(commit.ok, "{:?}", commit.error);

    let inbox = node(&engine, &roots, "inbox");
    assert_eq!(engine.node_state(&inbox, &instance).await.unwrap(), NodeState::Active);
    let started: Vec<FlowNodeId> = drain(&mut transitions)
        .into_iter()
        .filter(|t| t.to == NodeState::Active)
        .map(|t| t.node_id)
        .collect();
    assert!(started.contains(&node(&engine, &roots, "web")));
    assert!(started.contains(&node(&engine, &roots, "mail")));
}

#[tokio::test]
async fn test_start_requires_deployed_process_with_start_event() {
    let engine = engine();
    let unknown = procgraph::identity::process_id("acme", "ghost", "1");
    assert!(matches!(
        engine.start_instance(&unknown, None).await,
        Err(CoreError::ConfigurationError(_))
    ));

    let definition = ProcessDefinition::new("headless", "1")
        .with_node(FlowNodeDefinition::new("wait", "receiveTask"));
    let roots = engine.deploy("acme", &definition).await.unwrap();
    assert!(matches!(
        engine.start_instance(&roots.process_id, None).await,
        Err(CoreError::ConfigurationError(_))
    ));
}

#[test_log::test(tokio::test)]
async fn test_teardown_and_redeploy() {
    let engine = engine();
    let definition = two_waiting_tasks();
    let roots = engine.deploy("acme", &definition).await.unwrap();
    let start = node(&engine, &roots, "start");

    assert_eq!(engine.teardown(&roots.process_id).await, 5);
    assert!(matches!(engine.endpoint(&start), Err(CoreError::RegistryError(_))));
    assert_eq!(engine.teardown(&roots.process_id).await, 0);

    let again = engine.deploy("acme", &definition).await.unwrap();
    assert_eq!(again.process_id, roots.process_id);
    assert_eq!(engine.registry().len(), 5);
    let (_, commit) = engine.start_instance(&again.process_id, None).await.unwrap();
    assert!(commit.ok, "{:?}", commit.error);
}

#[tokio::test]
async fn test_definition_round_trips_through_json() {
    let definition = two_waiting_tasks();
    let text = serde_json::to_string(&definition).unwrap();
    let parsed: ProcessDefinition = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, definition);

    let engine = engine();
    let first = engine.deploy("acme", &definition).await.unwrap();
    let second = engine.deploy("acme", &parsed).await.unwrap();
    assert_eq!(first.process_id, second.process_id);
}

#[tokio::test]
async fn test_redeploy_replaces_a_dead_node_service() {
    let engine = engine();
    let definition = ProcessDefinition::new("pair", "1")
        .with_node(FlowNodeDefinition::new("a", "startEvent"))
        .with_node(FlowNodeDefinition::new("b", "endEvent"))
        .with_flow("f", "a", "b");
    let roots = engine.deploy("acme", &definition).await.unwrap();
    let a = node(&engine, &roots, "a");
    let b = node(&engine, &roots, "b");

    let old_b = engine.endpoint(&b).unwrap();
    old_b.stop().await.unwrap();
    // Queued behind the stop, so it only fails once the mailbox is closed
    assert!(engine
        .node_state(&b, &procgraph::runtime::ProcessInstanceId::new())
        .await
        .is_err());

    engine.deploy("acme", &definition).await.unwrap();
    assert_eq!(engine.registry().len(), 2);
    assert!(!engine.endpoint(&a).unwrap().is_closed());
    assert!(!engine.endpoint(&b).unwrap().is_closed());

    let (instance, commit) = engine.start_instance(&roots.process_id, None).await.unwrap();
    assert!(commit.ok, "{:?}", commit.error);
    assert_eq!(engine.node_state(&b, &instance).await.unwrap(), NodeState::Inactive);
}

#[tokio::test]
async fn test_redeploy_refreshes_terminate_targets() {
    let engine = engine();
    let roots = engine.deploy("acme", &two_waiting_tasks()).await.unwrap();
    let r2 = node(&engine, &roots, "r2");
    engine.endpoint(&r2).unwrap().stop().await.unwrap();
    assert!(engine
        .node_state(&r2, &procgraph::runtime::ProcessInstanceId::new())
        .await
        .is_err());

    engine.deploy("acme", &two_waiting_tasks()).await.unwrap();
    let (instance, commit) = engine.start_instance(&roots.process_id, None).await.unwrap();
    assert!(commit.ok, "{:?}", commit.error);
    assert_eq!(engine.node_state(&r2, &instance).await.unwrap(), NodeState::Active);

    let terminate = engine.endpoint(&node(&engine, &roots, "T")).unwrap();
    let commit = terminate
        .activate_instance(&instance, None, Instant::now() + Duration::from_secs(10))
        .await;
    assert!(commit.ok, "{:?}", commit.error);
    assert_eq!(engine.node_state(&r2, &instance).await.unwrap(), NodeState::Inactive);
}
