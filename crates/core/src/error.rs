//! Core error model.
//!
//! Keep this focused on deterministic failures at the foundation layer
//! (invalid identifiers, malformed configuration). Infrastructure and
//! dispatch errors live in `keelson-engine`.

use thiserror::Error;

/// Result type used across the core layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty or parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A configuration/programmer error. Fatal, never retried.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
