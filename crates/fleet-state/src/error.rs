use std::io;

/// Crate-local error type for `fleet-state` operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("name record version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("ownership conflict: {0}")]
    Ownership(String),

    #[error("bus error: {0}")]
    Bus(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
