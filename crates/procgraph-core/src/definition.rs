//! Parsed process definitions and node kind resolution.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::CoreError;

/// A parsed process definition, addressed by (client, id, version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub flow_elements: Vec<FlowElement>,
}

/// Either a node or an edge of one nesting level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "camelCase")]
pub enum FlowElement {
    FlowNode(FlowNodeDefinition),
    SequenceFlow(SequenceFlowDefinition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// BPMN element name, e.g. `serviceTask` or `intermediateCatchEvent`
    pub element_type: String,
    #[serde(default)]
    pub event_definition: Option<EventDefinitionSpec>,
    /// Children of a sub-process container
    #[serde(default)]
    pub flow_elements: Vec<FlowElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFlowDefinition {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
}

/// Event definition attached to an event node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventDefinitionSpec {
    Terminate,
    Message { message_ref: String },
    Signal { signal_ref: String },
    Timer { duration_ms: u64 },
}

impl ProcessDefinition {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            version: version.into(),
            flow_elements: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: FlowNodeDefinition) -> Self {
        self.flow_elements.push(FlowElement::FlowNode(node));
        self
    }

    pub fn with_flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.flow_elements
            .push(FlowElement::SequenceFlow(SequenceFlowDefinition::new(id, source, target)));
        self
    }

    /// Check the whole tree, including nested sub-processes.
    ///
    /// Runs before anything is persisted so a rejected definition leaves no trace.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_level(&self.id, &self.flow_elements)
    }
}

impl FlowNodeDefinition {
    pub fn new(id: impl Into<String>, element_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            element_type: element_type.into(),
            event_definition: None,
            flow_elements: Vec::new(),
        }
    }

    pub fn with_event_definition(mut self, event_definition: EventDefinitionSpec) -> Self {
        self.event_definition = Some(event_definition);
        self
    }

    pub fn with_node(mut self, node: FlowNodeDefinition) -> Self {
        self.flow_elements.push(FlowElement::FlowNode(node));
        self
    }

    pub fn with_flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.flow_elements
            .push(FlowElement::SequenceFlow(SequenceFlowDefinition::new(id, source, target)));
        self
    }
}

impl SequenceFlowDefinition {
    pub fn new(id: &str, source: &str, target: &str) -> Self {
        Self {
            id: id.to_string(),
            source_ref: source.to_string(),
            target_ref: target.to_string(),
        }
    }
}

/// Split one level into its flow nodes and sequence flows
pub fn partition(
    elements: &[FlowElement],
) -> (Vec<&FlowNodeDefinition>, Vec<&SequenceFlowDefinition>) {
    let mut nodes = Vec::new();
    let mut flows = Vec::new();
    for element in elements {
        match element {
            FlowElement::FlowNode(node) => nodes.push(node),
            FlowElement::SequenceFlow(flow) => flows.push(flow),
        }
    }
    (nodes, flows)
}

fn validate_level(scope: &str, elements: &[FlowElement]) -> Result<(), CoreError> {
    let (nodes, flows) = partition(elements);

    let mut ids = HashSet::new();
    for node in &nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(CoreError::ConfigurationError(format!(
                "duplicate flow node id '{}' in scope '{}'",
                node.id, scope
            )));
        }
        let kind = NodeKind::resolve(node)?;
        if kind != NodeKind::SubProcess && !node.flow_elements.is_empty() {
            return Err(CoreError::ConfigurationError(format!(
                "flow node '{}' of kind {} cannot contain flow elements",
                node.id, kind
            )));
        }
    }

    for flow in &flows {
        for (role, reference) in [("source", &flow.source_ref), ("target", &flow.target_ref)] {
            if !ids.contains(reference.as_str()) {
                return Err(CoreError::ConfigurationError(format!(
                    "sequence flow '{}' has dangling {} '{}' in scope '{}'",
                    flow.id, role, reference, scope
                )));
            }
        }
    }

    for node in nodes {
        if !node.flow_elements.is_empty() {
            validate_level(&node.id, &node.flow_elements)?;
        }
    }
    Ok(())
}

/// Closed set of node semantics the runtime can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    TerminateEndEvent,
    Task,
    ReceiveTask,
    MessageCatchEvent,
    TimerCatchEvent,
    ParallelGateway,
    SubProcess,
}

impl NodeKind {
    /// Resolve the kind of a node from its element type and event definition
    pub fn resolve(node: &FlowNodeDefinition) -> Result<Self, CoreError> {
        use EventDefinitionSpec::*;

        let kind = match (node.element_type.as_str(), &node.event_definition) {
            ("startEvent", None) => NodeKind::StartEvent,
            ("endEvent", None) => NodeKind::EndEvent,
            ("endEvent", Some(Terminate)) => NodeKind::TerminateEndEvent,
            (
                "task" | "serviceTask" | "userTask" | "scriptTask" | "sendTask" | "manualTask"
                | "businessRuleTask",
                None,
            ) => NodeKind::Task,
            ("receiveTask", None | Some(Message { .. })) => NodeKind::ReceiveTask,
            ("intermediateCatchEvent", Some(Message { .. } | Signal { .. })) => {
                NodeKind::MessageCatchEvent
            }
            ("intermediateCatchEvent", Some(Timer { .. })) => NodeKind::TimerCatchEvent,
            ("parallelGateway", None) => NodeKind::ParallelGateway,
            ("subProcess", None) => NodeKind::SubProcess,
            (element_type, event_definition) => {
                return Err(CoreError::ConfigurationError(format!(
                    "unsupported flow node '{}': element type '{}' with event definition {:?}",
                    node.id, element_type, event_definition
                )))
            }
        };
        Ok(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::StartEvent => "startEvent",
            NodeKind::EndEvent => "endEvent",
            NodeKind::TerminateEndEvent => "terminateEndEvent",
            NodeKind::Task => "task",
            NodeKind::ReceiveTask => "receiveTask",
            NodeKind::MessageCatchEvent => "messageCatchEvent",
            NodeKind::TimerCatchEvent => "timerCatchEvent",
            NodeKind::ParallelGateway => "parallelGateway",
            NodeKind::SubProcess => "subProcess",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
