//! Common error types for evidex
//!
//! Fatal conditions only. Per-message decode problems are carried as values
//! inside extraction reports and never surface here.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for evidex operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the evidex crates
#[derive(Error, Debug)]
pub enum Error {
    /// Ambiguous or invalid configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configured source could not be opened or read
    #[error("Source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    /// Every configured source was unavailable
    #[error("No usable sources: all {0} configured sources were unavailable")]
    NoUsableSources(usize),

    /// A source expected to be untouched was modified during the run
    #[error("Integrity violation: {path}: expected sha256 {expected}, found {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Durable write to an audit or decision log failed after retries
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The run was cancelled before completion
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (wraps serde_json::Error)
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that must abort the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::SourceUnavailable { .. })
    }
}
