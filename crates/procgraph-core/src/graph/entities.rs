use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Property bag persisted with a vertex
pub type VertexProperties = BTreeMap<String, Value>;

/// Entity kinds the Graph Store addresses by natural key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VertexKind {
    Root,
    Client,
    RunningRoot,
    ArchiveRoot,
    Process,
    FlowNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationKind {
    HasClient,
    HasRunningRoot,
    HasArchiveRoot,
    HasProcess,
    HasFlowNode,
    HasSubProcessNode,
    FollowedBy,
}

/// Natural key of a vertex; unique per kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexKey {
    pub kind: VertexKind,
    pub natural_key: String,
}

impl VertexKey {
    pub fn new(kind: VertexKind, natural_key: impl Into<String>) -> Self {
        Self {
            kind,
            natural_key: natural_key.into(),
        }
    }
}

impl fmt::Display for VertexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.natural_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    /// Store-assigned surrogate id
    pub graph_id: Uuid,
    pub key: VertexKey,
    pub properties: VertexProperties,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vertex {
    pub fn new(key: VertexKey, properties: VertexProperties) -> Self {
        let now = Utc::now();
        Self {
            graph_id: Uuid::new_v4(),
            key,
            properties,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> VertexKind {
        self.key.kind
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }
}

/// Directed edge between two vertices
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub from: VertexKey,
    pub kind: RelationKind,
    pub to: VertexKey,
}
