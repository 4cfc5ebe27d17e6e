//! Custom error types for Mend.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the application.
//!
//! Two error families live here:
//!
//! - [`MendError`] - the crate-wide error type used by configuration,
//!   the repair loop, and the VCS/test boundaries.
//! - [`InvokeError`] - the outcome taxonomy for a single backend
//!   invocation. The rotation manager branches on its variants: only
//!   [`InvokeError::UsageLimit`] is treated as transient and eligible
//!   for retry-then-rotate; everything else surfaces unmodified.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Mend operations.
#[derive(Error, Debug)]
pub enum MendError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Repair Loop Errors
    // =========================================================================
    /// Repair loop execution failed
    #[error("Repair loop error: {message}")]
    Loop { message: String },

    /// Test execution failed at the process level (not a failing suite)
    #[error("Test execution failed: {message}")]
    TestExecution { message: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// A backend client factory failed; never retried or rotated past
    #[error("Backend '{backend}' could not be constructed: {message}")]
    BackendFactory { backend: String, message: String },

    /// Backend invocation failed after rotation had no more options
    #[error("Backend invocation failed: {message}")]
    Invocation { message: String },

    // =========================================================================
    // VCS Errors
    // =========================================================================
    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Push failed after a successful commit; escalated to process exit
    /// because a committed-but-unpushed passing fix is worse than a
    /// visible failure
    #[error("Push failed after commit: {message}")]
    PushFailed { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MendError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid-configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a repair loop error
    pub fn loop_error(message: impl Into<String>) -> Self {
        Self::Loop {
            message: message.into(),
        }
    }

    /// Create a test execution error
    pub fn test_execution(message: impl Into<String>) -> Self {
        Self::TestExecution {
            message: message.into(),
        }
    }

    /// Create a backend factory error
    pub fn backend_factory(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendFactory {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a push failure error
    pub fn push_failed(message: impl Into<String>) -> Self {
        Self::PushFailed {
            message: message.into(),
        }
    }

    /// Check if this error should terminate the whole process, not just
    /// the repair loop.
    #[must_use]
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, Self::PushFailed { .. })
    }
}

/// Convenience type alias for Results with `MendError`
pub type Result<T> = std::result::Result<T, MendError>;

/// Outcome taxonomy for a single backend invocation.
///
/// The rotation manager matches on these variants to decide what to do
/// next:
///
/// - [`InvokeError::UsageLimit`] - provider-reported quota/rate
///   condition. Retried against the same backend while retry credits
///   remain, then rotated past.
/// - [`InvokeError::Timeout`] - the invocation exceeded an externally
///   enforced deadline. Fatal to the current call; not retried here.
/// - [`InvokeError::Other`] - every other failure mode. Attributed to
///   the prompt or environment, surfaced to the caller unmodified.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// Provider reported a rate/quota condition
    #[error("Usage limit reached: {message}")]
    UsageLimit { message: String },

    /// Invocation exceeded an externally enforced deadline
    #[error("Invocation timed out: {message}")]
    Timeout { message: String },

    /// Any other invocation failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InvokeError {
    /// Create a usage limit error
    pub fn usage_limit(message: impl Into<String>) -> Self {
        Self::UsageLimit {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Check whether this is a usage limit condition
    #[must_use]
    pub fn is_usage_limit(&self) -> bool {
        matches!(self, Self::UsageLimit { .. })
    }
}

impl From<InvokeError> for MendError {
    fn from(err: InvokeError) -> Self {
        Self::Invocation {
            message: err.to_string(),
        }
    }
}
