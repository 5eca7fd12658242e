//! Logging for procgraph hosts.

use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod logging;
pub mod transitions;

pub use logging::init_logging;
pub use transitions::{describe, spawn_transition_logger};

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to the startup event
    pub service_name: String,

    /// Filter used when `RUST_LOG` is not set
    pub log_filter: String,

    /// Emit JSON lines instead of pretty output
    pub json_logs: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "procgraph".to_string(),
            log_filter: "info".to_string(),
            json_logs: false,
        }
    }
}

impl MonitoringConfig {
    /// Defaults overridden by `PROCGRAPH_LOG`, `PROCGRAPH_SERVICE_NAME` and `PROCGRAPH_LOG_FORMAT`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(filter) = lookup("PROCGRAPH_LOG") {
            config.log_filter = filter;
        }
        if let Some(service) = lookup("PROCGRAPH_SERVICE_NAME") {
            config.service_name = service;
        }
        if let Some(format) = lookup("PROCGRAPH_LOG_FORMAT") {
            match format.to_ascii_lowercase().as_str() {
                "json" => config.json_logs = true,
                "pretty" | "text" => config.json_logs = false,
                other => warn!(value = other, "Invalid PROCGRAPH_LOG_FORMAT, using pretty"),
            }
        }
        config
    }
}
