//! Engine configuration
//!
//! Defaults are applied per field; [`EngineConfig::load`] layers `PROCGRAPH_*`
//! environment overrides on top of them.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::CoreError;

/// Runtime configuration shared by the builder and every node service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound applied to every externally triggered operation, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Share of the remaining bound an aggregator may spend waiting on others
    #[serde(default = "default_deactivation_timeout_fraction")]
    pub deactivation_timeout_fraction: f64,

    /// Capacity of each node service mailbox
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Capacity of the node transition broadcast channel
    #[serde(default = "default_transition_buffer")]
    pub transition_buffer: usize,
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_deactivation_timeout_fraction() -> f64 {
    0.97
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_transition_buffer() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            deactivation_timeout_fraction: default_deactivation_timeout_fraction(),
            mailbox_capacity: default_mailbox_capacity(),
            transition_buffer: default_transition_buffer(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn load() -> Result<Self, CoreError> {
        let mut config = Self::default();

        if let Ok(value) = env::var("PROCGRAPH_OPERATION_TIMEOUT_MS") {
            if let Ok(timeout) = value.parse::<u64>() {
                config.operation_timeout_ms = timeout;
            } else {
                warn!("Invalid PROCGRAPH_OPERATION_TIMEOUT_MS value: {}", value);
            }
        }

        if let Ok(value) = env::var("PROCGRAPH_DEACTIVATION_TIMEOUT_FRACTION") {
            if let Ok(fraction) = value.parse::<f64>() {
                config.deactivation_timeout_fraction = fraction;
            } else {
                warn!("Invalid PROCGRAPH_DEACTIVATION_TIMEOUT_FRACTION value: {}", value);
            }
        }

        if let Ok(value) = env::var("PROCGRAPH_MAILBOX_CAPACITY") {
            if let Ok(capacity) = value.parse::<usize>() {
                config.mailbox_capacity = capacity;
            } else {
                warn!("Invalid PROCGRAPH_MAILBOX_CAPACITY value: {}", value);
            }
        }

        if let Ok(value) = env::var("PROCGRAPH_TRANSITION_BUFFER") {
            if let Ok(buffer) = value.parse::<usize>() {
                config.transition_buffer = buffer;
            } else {
                warn!("Invalid PROCGRAPH_TRANSITION_BUFFER value: {}", value);
            }
        }

        config.validate()?;

        info!(
            operation_timeout_ms = config.operation_timeout_ms,
            fraction = config.deactivation_timeout_fraction,
            "Loaded engine configuration"
        );

        Ok(config)
    }

    /// Reject values the runtime cannot honour
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.operation_timeout_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !(self.deactivation_timeout_fraction > 0.0 && self.deactivation_timeout_fraction < 1.0) {
            return Err(CoreError::ConfigurationError(format!(
                "deactivation_timeout_fraction must lie in (0, 1), got {}",
                self.deactivation_timeout_fraction
            )));
        }
        if self.mailbox_capacity == 0 || self.transition_buffer == 0 {
            return Err(CoreError::ConfigurationError(
                "mailbox_capacity and transition_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Shrink `remaining` by the configured fraction
    pub fn shortened(&self, remaining: Duration) -> Duration {
        scaled(remaining, self.deactivation_timeout_fraction)
    }
}

/// `duration * fraction`, rounded to the nearest nanosecond
pub fn scaled(duration: Duration, fraction: f64) -> Duration {
    Duration::from_nanos((duration.as_nanos() as f64 * fraction).round() as u64)
}
