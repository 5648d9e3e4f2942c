//! Error types for the mesh engine.
//!
//! Routine protocol outcomes (no route, duplicate, expired TTL, full
//! forward buffer) are counters and events, never errors. Errors are
//! reserved for precondition violations and configuration problems.

use super::packet::NodeId;
use thiserror::Error;

/// Mesh engine error type
#[derive(Error, Debug)]
pub enum MeshError {
    /// A node was started while not in an operational state
    #[error("node {0} is not operational")]
    NotOperational(NodeId),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reference to a node the harness does not know
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Topology description rejected
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for mesh operations
pub type MeshResult<T> = std::result::Result<T, MeshError>;
