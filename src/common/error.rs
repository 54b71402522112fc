//! Error types for pserver

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Coordination errors ===
    #[error("Coordination call timed out")]
    CoordinationTimeout,

    #[error("Coordination store error: {0}")]
    Coordination(String),

    #[error("Shard {0} is already claimed by a live registration")]
    ShardAlreadyClaimed(u32),

    // === Client errors ===
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Stale update: last accepted seq {last}, got {got}")]
    StaleUpdate { last: u64, got: u64 },

    // === Checkpoint errors ===
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    // === Lifecycle errors ===
    #[error("Not serving: {0}")]
    NotServing(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Transport errors ===
    #[error("Wire protocol error: {0}")]
    Wire(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Errors reported by a remote pserver ===
    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Compact error classification carried over the wire so clients can match on
/// the failure kind without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    CoordinationTimeout,
    Coordination,
    ShardAlreadyClaimed,
    ShapeMismatch,
    UnknownParameter,
    StaleUpdate,
    CorruptCheckpoint,
    CheckpointNotFound,
    NotServing,
    Timeout,
    Internal,
}

impl Error {
    /// Is this a retryable (transient) error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CoordinationTimeout | Error::Coordination(_) | Error::Timeout(_)
        )
    }

    /// Wire classification for RPC responses.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::CoordinationTimeout => ErrorCode::CoordinationTimeout,
            Error::Coordination(_) => ErrorCode::Coordination,
            Error::ShardAlreadyClaimed(_) => ErrorCode::ShardAlreadyClaimed,
            Error::ShapeMismatch { .. } => ErrorCode::ShapeMismatch,
            Error::UnknownParameter(_) => ErrorCode::UnknownParameter,
            Error::StaleUpdate { .. } => ErrorCode::StaleUpdate,
            Error::CorruptCheckpoint(_) => ErrorCode::CorruptCheckpoint,
            Error::CheckpointNotFound(_) => ErrorCode::CheckpointNotFound,
            Error::NotServing(_) => ErrorCode::NotServing,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
