//! Domain error types.

use thiserror::Error;

/// Errors raised by domain-level validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// Node ids are small positive integers
    #[error("Invalid node id: {0}")]
    InvalidNodeId(i32),

    /// attkind strings must be non-empty `[kv]+` with at least one key column
    #[error("Invalid attkind: {0}")]
    InvalidAttKind(String),

    /// Snapshot text could not be parsed
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Unknown event type received from a peer
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Unknown log command type
    #[error("Unknown command type: {0}")]
    UnknownCmdType(String),

    /// Event data slot out of range or missing
    #[error("Missing event data field {0}")]
    MissingEventData(usize),
}
