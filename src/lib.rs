//! # Document Manager
//!
//! A bulk-buffered replication engine that keeps a searchable document
//! store in sync with an upstream change log.
//!
//! ## Architecture
//!
//! The engine sits between the host's change feed and the document store,
//! coalescing intents into idempotent bulk writes:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            doc-manager                                  │
//! │                                                                         │
//! │  ┌──────────────┐    ┌─────────────────┐    ┌────────────────────────┐  │
//! │  │ ChangeIntent │───►│ OperationBuffer │───►│ BulkDispatcher         │  │
//! │  │ (per ns)     │    │ (coalescing)    │    │ (retry + circuit)      │  │
//! │  └──────────────┘    └─────────────────┘    └────────────────────────┘  │
//! │         │                                              │                │
//! │         ▼                                              ▼                │
//! │  ┌─────────────────┐                      ┌─────────────────────────┐   │
//! │  │ CheckpointStore │                      │ CommitLogTracker        │   │
//! │  │ (SQLite)        │                      │ (rollback compensation) │   │
//! │  └─────────────────┘                      └─────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Recovery Paths
//!
//! 1. **Rollback**: the commit log retains every confirmed operation with a
//!    compensating inverse; `rollback(token)` undoes recent history in place.
//! 2. **Resync**: an epoch-tagged full pass rebuilds a namespace from an
//!    authoritative snapshot and sweeps documents the snapshot no longer has.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_manager::{ChangeIntent, DocManager, DocManagerConfig, Namespace, SequenceToken};
//! use serde_json::{json, Map};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = DocManagerConfig::default();
//!     let engine = DocManager::new(config);
//!     engine.start().await.expect("Failed to start");
//!
//!     let ns = Namespace::new("app", "users");
//!     let mut fields = Map::new();
//!     fields.insert("name".to_string(), json!("alice"));
//!     engine
//!         .apply(ChangeIntent::upsert(
//!             ns,
//!             json!("user-1"),
//!             fields,
//!             SequenceToken::from_parts(1712345678, 0),
//!         ))
//!         .await
//!         .expect("Failed to apply");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod buffer;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod codec;
pub mod commit_log;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod namespace;
pub mod resilience;
pub mod resync;
pub mod store;
pub mod token;

// Re-exports for convenience
pub use buffer::{BufferedOperation, OperationBuffer, OperationKind};
pub use checkpoint::CheckpointStore;
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
pub use codec::{BinaryPolicy, DocumentCodec, StoreDocument, StoreUpdate, UpdateSpec};
pub use commit_log::{AppliedOp, CommitLogEntry, CommitLogTracker, Compensation};
pub use config::{BufferConfig, DispatchConfig, DocManagerConfig, ResyncConfig};
pub use dispatch::{BatchOutcome, BulkDispatcher, FatalItem};
pub use engine::{
    ChangeIntent, DocManager, EngineState, HealthCheck, RollbackReport, ShutdownReport,
};
pub use error::{DocManagerError, Result};
pub use namespace::{IndexMapping, Namespace, NamespaceMapper};
pub use resync::{Resynchronizer, ResyncReport};
pub use store::{DocumentStore, ItemStatus, NoOpStore, StoreAction, StoreOp};
pub use token::SequenceToken;
