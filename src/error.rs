// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the document manager.
//!
//! Errors are categorized by their source (store, checkpoint, rollback,
//! etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `TransientStore` | Yes | Store timeouts, resource exhaustion, connection drops |
//! | `StoreUnavailable` | Yes | A whole batch exhausted its retries; ops were requeued |
//! | `MalformedDocument` | No | One document failed encoding or was rejected by the store |
//! | `RollbackWindowExceeded` | No | Rollback point predates the retained commit log |
//! | `Checkpoint` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`DocManagerError::is_retryable()`] to determine if an operation
//! should be retried with backoff. Retryable errors indicate transient
//! store availability issues. Non-retryable errors indicate bugs,
//! configuration problems, or documents the store will never accept.

use crate::token::SequenceToken;
use thiserror::Error;

/// Result type alias for document manager operations.
pub type Result<T> = std::result::Result<T, DocManagerError>;

/// Errors that can occur while replicating documents.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum DocManagerError {
    /// Transient store failure.
    ///
    /// Occurs when a store call times out or the store reports resource
    /// exhaustion. Retryable with exponential backoff.
    #[error("Transient store error ({operation}): {message}")]
    TransientStore { operation: String, message: String },

    /// Every retry for a whole batch was exhausted.
    ///
    /// The batch's operations were returned to the buffer head and the
    /// namespace's flush worker backs off before trying again. Nothing
    /// is dropped and the acked token does not advance.
    #[error("Store unavailable for index {index}: gave up after {attempts} attempts")]
    StoreUnavailable { index: String, attempts: usize },

    /// One document could not be encoded or was rejected by the store.
    ///
    /// Fatal for that document only; other items in the batch and
    /// subsequent batches continue. Redelivery would fail identically.
    #[error("Malformed document {namespace}/{id}: {reason}")]
    MalformedDocument {
        namespace: String,
        id: String,
        reason: String,
    },

    /// The rollback point predates the oldest retained commit-log entry.
    ///
    /// The caller must fall back to a full resync of the affected
    /// namespaces instead of a partial undo.
    #[error("Rollback window exceeded: requested {requested}, oldest retained {oldest}")]
    RollbackWindowExceeded {
        requested: SequenceToken,
        oldest: SequenceToken,
    },

    /// SQLite error during checkpoint persistence.
    ///
    /// Occurs when reading/writing acked tokens or the commit-log window.
    /// Not retryable - indicates local database issues that need attention.
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Occurs during engine initialization if config is malformed.
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running engine).
    /// Not retryable - indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// Returned when operations are attempted during shutdown.
    /// Not retryable - engine is terminating.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    /// Not retryable - indicates a bug that needs investigation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocManagerError {
    /// Create a transient store error.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientStore {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-document error.
    pub fn malformed(
        namespace: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedDocument {
            namespace: namespace.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientStore { .. } => true, // Store hiccups are retryable
            Self::StoreUnavailable { .. } => true, // Requeued; delivery resumes later
            Self::MalformedDocument { .. } => false, // Store will never accept it
            Self::RollbackWindowExceeded { .. } => false,
            Self::Checkpoint(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
