//! Message-driven runtime for BPMN-style process graphs.
//!
//! Re-exports the engine from `procgraph-core` and the logging setup from
//! `procgraph-monitoring`.

pub use procgraph_core::*;
pub use procgraph_monitoring::{init_logging, spawn_transition_logger, MonitoringConfig};

use anyhow::Context;
use std::path::Path;

/// Read a JSON process definition from disk and validate it
pub fn load_definition(path: &Path) -> anyhow::Result<ProcessDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let definition: ProcessDefinition = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    definition.validate()?;
    Ok(definition)
}
