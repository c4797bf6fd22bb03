//! Error types for visionpool.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the helper pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Helper error: {0}")]
    Helper(String),

    #[error("Analysis of item {sequence_id} failed: {message}")]
    Analysis { sequence_id: usize, message: String },

    #[error("Batch cancelled by shutdown request")]
    Cancelled,

    #[error("Timed out after {waited:?} waiting for {pending} result(s) from helpers")]
    DispatchTimeout { pending: usize, waited: Duration },

    #[error("Previous batch still has {pending} pending result(s); collect it first")]
    BatchInFlight { pending: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl PoolError {
    /// Whether this error ends the current batch but leaves the pool usable.
    pub fn is_batch_failure(&self) -> bool {
        matches!(self, Self::DispatchTimeout { .. } | Self::BatchInFlight { .. })
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
