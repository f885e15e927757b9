//! Engine state and report types.
//!
//! Defines the state machine for the document manager lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (already stopped)            │ (checkpoint store open)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!                              │
//!                    (unrecoverable error)
//!                              ↓
//!                           Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `DocManager::new()`. Nothing persisted, no workers.
//! - **Starting**: `start()` called, opening the checkpoint store and restoring the commit log.
//! - **Running**: Normal operation. Intents are buffered, coalesced, and flushed.
//! - **ShuttingDown**: `shutdown()` called. Lanes are draining pending batches.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Unrecoverable error. Engine cannot continue.

use crate::buffer::OperationKind;
use crate::codec::UpdateSpec;
use crate::dispatch::FatalItem;
use crate::namespace::Namespace;
use crate::token::SequenceToken;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// State of the document manager.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::DocManager::start) to begin accepting intents.
    Created,

    /// Opening the checkpoint store and restoring persisted state.
    Starting,

    /// Running: intents are accepted, buffered, and flushed.
    Running,

    /// Shutting down gracefully.
    ///
    /// Lanes are draining pending batches and acked tokens are persisted.
    /// Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped.
    ///
    /// Engine has shut down cleanly. Safe to drop.
    Stopped,

    /// Failed to start or unrecoverable error.
    ///
    /// Check logs for error details. Engine cannot recover from this state.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// One change observed upstream, addressed to one document.
#[derive(Debug, Clone)]
pub struct ChangeIntent {
    pub namespace: Namespace,
    /// Raw upstream id value; canonicalized to a string on ingest.
    pub id: Value,
    pub op: OperationKind,
    /// Position of this change in the upstream log.
    pub token: SequenceToken,
}

impl ChangeIntent {
    pub fn upsert(
        namespace: Namespace,
        id: Value,
        fields: Map<String, Value>,
        token: SequenceToken,
    ) -> Self {
        Self {
            namespace,
            id,
            op: OperationKind::Upsert(fields),
            token,
        }
    }

    pub fn partial_update(
        namespace: Namespace,
        id: Value,
        spec: UpdateSpec,
        token: SequenceToken,
    ) -> Self {
        Self {
            namespace,
            id,
            op: OperationKind::PartialUpdate(spec),
            token,
        }
    }

    pub fn delete(namespace: Namespace, id: Value, token: SequenceToken) -> Self {
        Self {
            namespace,
            id,
            op: OperationKind::Delete,
            token,
        }
    }
}

/// What a rollback accomplished.
#[derive(Debug)]
pub struct RollbackReport {
    /// The requested rollback point (inclusive).
    pub since: SequenceToken,
    /// Entries undone, newest first.
    pub undone: usize,
    /// Documents restored to a prior version.
    pub restored: usize,
    /// Documents deleted (their creation was undone).
    pub deleted: usize,
    /// Documents with no recoverable prior state.
    pub missing: usize,
    /// Compensations the store rejected.
    pub failed: Vec<FatalItem>,
    pub duration: Duration,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.missing == 0
    }
}

/// How a shutdown went.
#[derive(Debug)]
pub struct ShutdownReport {
    /// True when every lane drained within the grace period.
    pub drained: bool,
    /// Operations still buffered per namespace when the grace period ran out.
    /// The host redelivers these from the acked token after restart.
    pub unflushed: HashMap<String, usize>,
    /// Last confirmed token per namespace at shutdown.
    pub acked: HashMap<String, SequenceToken>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.drained && self.unflushed.is_empty()
    }
}

/// Per-namespace health snapshot.
#[derive(Debug, Clone)]
pub struct NamespaceHealth {
    pub namespace: String,
    /// Distinct documents pending flush.
    pub pending: usize,
    /// Estimated buffered bytes.
    pub pending_bytes: usize,
    /// True while a resync or rollback has the lane paused.
    pub paused: bool,
    /// Last confirmed token.
    pub acked: Option<SequenceToken>,
}

/// Comprehensive health status for monitoring endpoints.
///
/// Collected from cached internal state; no store I/O.
#[derive(Debug)]
pub struct HealthCheck {
    pub state: EngineState,
    /// True when the engine accepts intents.
    pub ready: bool,
    /// True when ready and the store circuits are closed.
    pub healthy: bool,
    /// True when a store circuit is open (writes are being rejected).
    pub circuit_open: bool,
    /// Total pending operations across all namespaces.
    pub buffered_total: usize,
    /// Retained commit-log entries (the rollback window).
    pub commit_log_entries: usize,
    /// Acked tokens not yet persisted to SQLite.
    pub checkpoint_dirty: usize,
    pub namespaces: Vec<NamespaceHealth>,
}
