//! Error taxonomy for the sentinel core.
//!
//! Mirrors the failure kinds in the error-handling design: policy denials
//! are not errors (they are ordinary verdicts), but store failures,
//! malformed configuration, and chain corruption are.

use thiserror::Error;

/// Top-level error type returned by the engine and its subsystems.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("invalid mode: {0}")]
    Mode(#[from] crate::types::ModeParseError),

    #[error("interceptor error: {0}")]
    Interceptor(String),
}

/// Errors from the persistent store layer (rusqlite-backed).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to read config file {path}: {message}")]
    IoError { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    ParseError { path: String, message: String },
}

/// Errors surfaced by the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("entry not found: sequence {0}")]
    NotFound(u64),
}
