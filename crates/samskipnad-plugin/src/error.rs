//! Plugin system error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::wire::WireError;

#[derive(Error, Debug)]
pub enum PluginError {
    /// No live registration exists under this name (covers "not loaded").
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("plugin capacity exceeded: {max} plugins already loaded")]
    CapacityExceeded { max: usize },

    #[error("plugin binary missing or not executable: {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("execution timeout: plugin {name} did not respond within {timeout_secs}s")]
    ExecutionTimeout { name: String, timeout_secs: u64 },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("capability error: {0}")]
    Capability(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("plugin host is shutting down")]
    ShuttingDown,

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Message sent back over the wire when a guest operation fails.
    ///
    /// Guest-reported failures travel without the variant prefix so the
    /// host can wrap them once in its own `Execution` error.
    pub fn guest_message(&self) -> String {
        match self {
            PluginError::Execution(msg) | PluginError::Capability(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}
