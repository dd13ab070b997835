//! Error types and handling
//!
//! This module provides the error types used throughout the Atrium engine.
//! All errors implement the `EngineErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Error messages never carry resolved secret values. Sandbox secrets and
//! connector keys are referenced by name only.

use thiserror::Error;

/// User-facing details for engine errors
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait EngineErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require a configuration change.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **NotFound**: assistant package, store record, connector or handler is missing
/// - **Validation**: a caller supplied a malformed value (unknown event, empty id)
/// - **Parse**: a descriptor field could not be normalized
/// - **NotConfigured**: a required collaborator (store, sandbox manager) is absent
/// - **Config**: the sandbox or runtime configuration is unusable
/// - **Execution**: a connector, script, search backend or sandbox failed
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineErrorExt, EngineError};
///
/// let error = EngineError::NotFound("assistant tests.basic".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(!error.is_recoverable());
///
/// let transient = EngineError::Execution("connector timed out".to_string());
/// assert!(transient.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),

    // Persistence errors
    #[error("Database error: {0}")]
    Database(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Returns true for `NotFound` errors
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl EngineErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::NotFound(_) => "The requested assistant or resource does not exist",
            Self::Validation(_) => "The request contains an invalid value",
            Self::Parse(_) => "An assistant definition is malformed. Check its package files",
            Self::NotConfigured(_) => "A required component is not configured",
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Execution(_) => "The operation failed. Try again",
            Self::Database(_) => "Database operation failed. Check the storage path",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::NotFound(_)
            | Self::Validation(_)
            | Self::Parse(_)
            | Self::NotConfigured(_)
            | Self::Config(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
