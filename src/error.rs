use thiserror::Error;

use crate::types::DeviceRole;

/// Positioning engine error types
#[derive(Error, Debug)]
pub enum PositioningError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to launch {role} collector on {port}: {source}")]
    SpawnFailed {
        role: DeviceRole,
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PositioningError>;
