// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store adapter trait.
//!
//! Defines the narrow interface the engine needs from a searchable document
//! store. Concrete clients live outside this crate; the trait is the
//! boundary, which also keeps tests against a mock cheap.
//!
//! # Example
//!
//! ```rust,no_run
//! use doc_manager::store::{DocumentStore, StoreAction, ItemStatus, BoxFuture};
//!
//! struct MyStoreClient { /* ... */ }
//!
//! impl DocumentStore for MyStoreClient {
//!     fn bulk_write(
//!         &self,
//!         _index: &str,
//!         actions: Vec<StoreAction>,
//!     ) -> BoxFuture<'_, Vec<ItemStatus>> {
//!         Box::pin(async move { Ok(actions.iter().map(|_| ItemStatus::Ok).collect()) })
//!     }
//!
//!     fn sweep_delete(
//!         &self,
//!         _index: &str,
//!         _epoch_field: &str,
//!         _keep_epoch: &str,
//!     ) -> BoxFuture<'_, u64> {
//!         Box::pin(async move { Ok(0) })
//!     }
//!
//!     fn get(&self, _index: &str, _id: &str) -> BoxFuture<'_, Option<doc_manager::codec::StoreDocument>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::codec::{StoreDocument, StoreUpdate};
use std::future::Future;
use std::pin::Pin;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Whole-call store failure (connection refused, request timeout).
///
/// Per-item failures are reported through [`ItemStatus`] instead; this
/// error means nothing in the call was applied.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// One item in a bulk call.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreAction {
    pub id: String,
    pub op: StoreOp,
}

/// What to do with one document.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Index the full document (create-or-replace).
    Index(StoreDocument),
    /// Apply a partial update (create-or-update by id).
    Update(StoreUpdate),
    /// Remove the document. Deleting an absent id is not an error.
    Delete,
}

/// Per-item outcome of a bulk call, positionally matching the input.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemStatus {
    /// The item was applied.
    Ok,
    /// Transient per-item failure (queue full, shard busy); safe to retry.
    Retryable(String),
    /// The store will never accept this item (mapping conflict, oversized).
    Fatal(String),
}

impl ItemStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Trait defining what the engine needs from the document store.
///
/// Implementations wrap a concrete search-store client. All three calls
/// are idempotent from the engine's perspective:
/// 1. Apply a batch of writes (`bulk_write`)
/// 2. Purge documents left over from a previous epoch (`sweep_delete`)
/// 3. Fetch one document (`get`, used by resync verification and tooling)
pub trait DocumentStore: Send + Sync + 'static {
    /// Apply a batch of actions against one index.
    ///
    /// Returns one [`ItemStatus`] per action, in input order. A returned
    /// `Err` means the whole call failed and nothing was applied.
    fn bulk_write(
        &self,
        index: &str,
        actions: Vec<StoreAction>,
    ) -> BoxFuture<'_, Vec<ItemStatus>>;

    /// Delete every document in `index` whose `epoch_field` value differs
    /// from `keep_epoch` (or is absent). Returns the number deleted.
    fn sweep_delete(
        &self,
        index: &str,
        epoch_field: &str,
        keep_epoch: &str,
    ) -> BoxFuture<'_, u64>;

    /// Fetch one document by id. `None` if absent.
    fn get(&self, index: &str, id: &str) -> BoxFuture<'_, Option<StoreDocument>>;
}

/// A no-op implementation for testing/standalone mode.
///
/// Logs operations but doesn't actually store anything; every item
/// succeeds.
#[derive(Clone)]
pub struct NoOpStore;

impl DocumentStore for NoOpStore {
    fn bulk_write(
        &self,
        index: &str,
        actions: Vec<StoreAction>,
    ) -> BoxFuture<'_, Vec<ItemStatus>> {
        let index = index.to_string();
        Box::pin(async move {
            tracing::debug!(
                index = %index,
                items = actions.len(),
                "NoOp: would bulk write"
            );
            Ok(actions.iter().map(|_| ItemStatus::Ok).collect())
        })
    }

    fn sweep_delete(
        &self,
        index: &str,
        epoch_field: &str,
        keep_epoch: &str,
    ) -> BoxFuture<'_, u64> {
        let index = index.to_string();
        let epoch_field = epoch_field.to_string();
        let keep_epoch = keep_epoch.to_string();
        Box::pin(async move {
            tracing::debug!(
                index = %index,
                epoch_field = %epoch_field,
                keep_epoch = %keep_epoch,
                "NoOp: would sweep delete"
            );
            Ok(0)
        })
    }

    fn get(&self, _index: &str, _id: &str) -> BoxFuture<'_, Option<StoreDocument>> {
        Box::pin(async { Ok(None) })
    }
}
