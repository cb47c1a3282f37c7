// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for workqueue-core.
//!
//! Backend-specific failures (sqlx, serde) are translated into the small
//! taxonomy below so callers only ever see queue-level errors.

use thiserror::Error;

use crate::element::ElementStatus;

/// Result type using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by queue operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Unknown policy name or otherwise unusable queue configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The workflow specification cannot be split.
    #[error("Invalid spec '{request_name}': {reason}")]
    InvalidSpec {
        /// Request the spec belongs to.
        request_name: String,
        /// Why the spec was rejected.
        reason: String,
    },

    /// The backing store failed or timed out; the caller should retry.
    #[error("Store error during '{operation}': {details}")]
    TransientStore {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Another caller modified the element first.
    #[error("Element '{element_id}' was modified concurrently")]
    ClaimConflict {
        /// The contested element.
        element_id: String,
    },

    /// Element was not found in the queue.
    #[error("Element '{element_id}' not found")]
    ElementNotFound {
        /// The element ID that was not found.
        element_id: String,
    },

    /// The requested status change is not allowed by the state machine.
    #[error("Element '{element_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The element ID.
        element_id: String,
        /// Current status.
        from: ElementStatus,
        /// Requested status.
        to: ElementStatus,
    },

    /// A policy produced or received values that break a queue invariant.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Stored data is inconsistent (orphaned child, duplicate split, bad document).
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidSpec { .. } => "INVALID_SPEC",
            Self::TransientStore { .. } => "TRANSIENT_STORE_ERROR",
            Self::ClaimConflict { .. } => "CLAIM_CONFLICT",
            Self::ElementNotFound { .. } => "ELEMENT_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Self::DataIntegrity(_) => "DATA_INTEGRITY_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether a harness loop should retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore { .. } | Self::ClaimConflict { .. })
    }

    pub(crate) fn store(operation: &str, details: impl ToString) -> Self {
        Self::TransientStore {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }

    pub(crate) fn invalid_spec(request_name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            request_name: request_name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::store("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for QueueError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        QueueError::store("migrate", err)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::DataIntegrity(format!("malformed element document: {}", err))
    }
}

impl From<crate::config::ConfigError> for QueueError {
    fn from(err: crate::config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}
