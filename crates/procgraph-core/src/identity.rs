//! Deterministic identifiers for processes and flow nodes.
//!
//! Identifiers are hex encoded SHA-256 digests over length-prefixed
//! components, so re-deriving an id from the same definition always yields
//! the same value and `("ab", "c")` never collides with `("a", "bc")`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix distinguishing archive-side ids from their running counterparts
pub const ARCHIVE_PREFIX: &str = "archive:";

/// Unique identifier of a running process definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub String);

/// Unique identifier of a flow node, also the address of its node service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowNodeId(pub String);

impl ProcessId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FlowNodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FlowNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered ids of the sub-processes enclosing a node, outermost first.
///
/// Values are never mutated in place; [`SubProcessPath::child`] returns a
/// fresh path so sibling sub-processes cannot observe each other's segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubProcessPath(Vec<String>);

impl SubProcessPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

fn digest<'a>(domain: &str, parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Id of the running process for (client, definition, version)
pub fn process_id(client_id: &str, definition_id: &str, version: &str) -> ProcessId {
    ProcessId(digest("process", [client_id, definition_id, version]))
}

/// Id of a flow node within a process, scoped by its sub-process path
pub fn flow_node_id(
    client_id: &str,
    process_id: &ProcessId,
    path: &SubProcessPath,
    local_node_id: &str,
) -> FlowNodeId {
    // The path length is hashed so that a path segment can never be read as a node id
    let depth = path.depth().to_string();
    let parts = [client_id, process_id.as_str(), depth.as_str()]
        .into_iter()
        .chain(path.segments().iter().map(String::as_str))
        .chain(std::iter::once(local_node_id));
    FlowNodeId(digest("flow-node", parts))
}

/// Archive-side counterpart of a running id
pub fn archived(id: &str) -> String {
    format!("{}{}", ARCHIVE_PREFIX, id)
}

pub fn is_archived(id: &str) -> bool {
    id.starts_with(ARCHIVE_PREFIX)
}
