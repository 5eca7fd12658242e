//! Error types for the procgraph runtime.

use std::io;
use thiserror::Error;

/// Core error type for building and driving process graphs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Definition or engine configuration rejected
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Graph Store failed a get-or-create, save or relationship call
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    /// An operation did not complete within its bound
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// A message was not valid for the receiving node in its current state
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Node registry lookup or registration failure
    #[error("Registry error: {0}")]
    RegistryError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IOError(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by [`GraphStore`](crate::graph::GraphStore) implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphStoreError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Vertex not found: {0}")]
    MissingVertex(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

impl From<GraphStoreError> for CoreError {
    fn from(err: GraphStoreError) -> Self {
        CoreError::PersistenceConflict(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Internal(s)
    }
}

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Internal(s.to_string())
    }
}
