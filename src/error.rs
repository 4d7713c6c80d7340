// src/error.rs

//! Error types for bag building, validation and the preservation service
//!
//! Only [`Error::Rerequest`] is treated as transient by the scheduler; every
//! other variant ends a preservation request in the `failed` state.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the bag model, builder, validator and service
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing setup; fatal and never retried
    #[error("configuration error: {0}")]
    Config(String),

    /// A bag path, record or request that does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Re-adding content that differs from what the bag already holds
    #[error("content conflict for {path}: bag has {expected}, new content is {actual}")]
    Conflict {
        path: String,
        expected: String,
        actual: String,
    },

    /// Transient condition; the scheduler requeues the request
    #[error("build must be re-requested: {0}")]
    Rerequest(String),

    /// The identifier already has a queued or running request
    #[error("preservation of {identifier} already in progress (request {request_id})")]
    AlreadyInProgress {
        identifier: String,
        request_id: String,
    },

    /// Path escapes its zone or is otherwise unusable
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Metadata record that is not a JSON object or lacks a required field
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Malformed manifest line
    #[error("malformed manifest at line {line}: {reason}")]
    Manifest { line: usize, reason: String },

    /// Cooperative cancellation was observed at a checkpoint
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    /// Whether the scheduler should requeue the request that raised this error
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rerequest(_))
    }
}
