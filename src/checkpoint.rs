// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable checkpoint state: acked tokens and the commit-log window.
//!
//! Stores the last-acked sequence token for each namespace in SQLite,
//! plus the retained commit-log entries so rollback survives a restart.
//!
//! # Debounced Writes
//!
//! To reduce SQLite write pressure, acked tokens are debounced:
//! - `set()` updates the in-memory cache immediately and marks the
//!   namespace dirty
//! - `flush_dirty()` persists all dirty tokens to disk in a batch
//! - The engine calls `flush_dirty()` periodically (every few seconds)
//! - On shutdown, `flush_dirty()` is called to ensure no data loss
//!
//! A crash between `set()` and `flush_dirty()` loses up to one flush
//! interval of ack progress. On restart the host redelivers from the
//! persisted token; redelivered operations are idempotent, so this is
//! safe.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. We handle this with:
//! - Automatic retry with exponential backoff
//! - Configurable max retries (default 5)
//! - Cache-first writes (cache is updated immediately, disk write retried)
//!
//! # Token Semantics
//!
//! The stored token is the **last successfully confirmed** sequence token
//! for a namespace. On restart, the host resumes delivery from the token
//! after it.

use crate::commit_log::CommitLogEntry;
use crate::error::{DocManagerError, Result};
use crate::token::SequenceToken;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Persistent checkpoint storage backed by SQLite.
///
/// Supports debounced writes: token updates go to cache immediately,
/// and are flushed to disk periodically via `flush_dirty()`.
pub struct CheckpointStore {
    pool: SqlitePool,
    /// In-memory acked-token cache for fast reads, keyed by namespace.
    cache: Arc<RwLock<HashMap<String, SequenceToken>>>,
    /// Namespaces with dirty (not yet persisted) tokens.
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
}

impl CheckpointStore {
    /// Create a new checkpoint store at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| DocManagerError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2) // Low concurrency needed
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS acked_tokens (
                namespace TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS commit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT NOT NULL,
                entry TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        // Load existing tokens into cache
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT namespace, token FROM acked_tokens")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (namespace, token) in rows {
            match token.parse::<u64>() {
                Ok(raw) => {
                    debug!(namespace = %namespace, token = %token, "Loaded acked token from disk");
                    cache.insert(namespace, SequenceToken::from_raw(raw));
                }
                Err(_) => warn!(namespace = %namespace, token = %token, "Skipping unparsable token row"),
            }
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored acked tokens from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path_str,
        })
    }

    /// Get the acked token for a namespace (from cache).
    ///
    /// Returns `None` if nothing was ever acked for this namespace.
    pub async fn get(&self, namespace: &str) -> Option<SequenceToken> {
        self.cache.read().await.get(namespace).copied()
    }

    /// Update the acked token for a namespace (debounced).
    ///
    /// Updates cache immediately, marks the namespace dirty.
    /// Call `flush_dirty()` periodically to persist to disk.
    pub async fn set(&self, namespace: &str, token: SequenceToken) {
        {
            let mut cache = self.cache.write().await;
            cache.insert(namespace.to_string(), token);
        }
        {
            let mut dirty = self.dirty.write().await;
            dirty.insert(namespace.to_string());
        }

        debug!(namespace = %namespace, token = %token, "Acked token updated (pending flush)");
    }

    /// Flush all dirty tokens to disk.
    ///
    /// Call this periodically and on shutdown.
    /// Returns the number of tokens flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        // Swap out dirty set atomically
        let dirty_namespaces: Vec<String> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_namespaces.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let cache = self.cache.read().await;
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for namespace in &dirty_namespaces {
            if let Some(token) = cache.get(namespace) {
                let namespace_owned = namespace.clone();
                let token_owned = token.raw().to_string();

                let result = execute_with_retry("checkpoint_flush", || async {
                    sqlx::query(
                        r#"
                        INSERT INTO acked_tokens (namespace, token, updated_at)
                        VALUES (?, ?, ?)
                        ON CONFLICT(namespace) DO UPDATE SET
                            token = excluded.token,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&namespace_owned)
                    .bind(&token_owned)
                    .bind(now)
                    .execute(pool)
                    .await
                })
                .await;

                match result {
                    Ok(_) => {
                        flushed += 1;
                        crate::metrics::record_checkpoint_persist(namespace, true);
                    }
                    Err(e) => {
                        errors += 1;
                        crate::metrics::record_checkpoint_persist(namespace, false);
                        warn!(namespace = %namespace, error = %e, "Failed to flush acked token");
                        // Re-mark as dirty so we retry next flush
                        self.dirty.write().await.insert(namespace.clone());
                    }
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty acked tokens");
            crate::metrics::record_checkpoint_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(DocManagerError::Internal(format!(
                "Failed to flush {} acked tokens",
                errors
            )));
        }

        Ok(flushed)
    }

    /// Check if there are any dirty (unflushed) tokens.
    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    /// Get count of dirty tokens pending flush.
    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Get all acked tokens (for diagnostics).
    pub async fn get_all(&self) -> HashMap<String, SequenceToken> {
        self.cache.read().await.clone()
    }

    /// Append commit-log entries (in order) to the persisted window.
    /// Retries on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
    pub async fn append_entries(&self, entries: &[CommitLogEntry]) -> Result<()> {
        let pool = &self.pool;
        for entry in entries {
            let token = entry.token.raw().to_string();
            let json = serde_json::to_string(entry)
                .map_err(|e| DocManagerError::Internal(format!("Unserializable log entry: {e}")))?;
            execute_with_retry("commit_log_append", || async {
                sqlx::query("INSERT INTO commit_log (token, entry) VALUES (?, ?)")
                    .bind(&token)
                    .bind(&json)
                    .execute(pool)
                    .await
            })
            .await?;
        }
        Ok(())
    }

    /// Load the persisted commit-log window in append order.
    pub async fn load_entries(&self) -> Result<Vec<CommitLogEntry>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT entry FROM commit_log ORDER BY seq ASC")
                .fetch_all(&self.pool)
                .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (json,) in rows {
            match serde_json::from_str(&json) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping undecodable commit-log row"),
            }
        }
        Ok(entries)
    }

    /// Drop persisted entries older than the in-memory retention window.
    pub async fn prune_entries_before(&self, token: SequenceToken) -> Result<u64> {
        let pool = &self.pool;
        let bound = token.raw().to_string();
        let result = execute_with_retry("commit_log_prune_before", || async {
            sqlx::query("DELETE FROM commit_log WHERE CAST(token AS INTEGER) < CAST(? AS INTEGER)")
                .bind(&bound)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop persisted entries undone by a rollback (`token >= bound`).
    pub async fn prune_entries_since(&self, token: SequenceToken) -> Result<u64> {
        let pool = &self.pool;
        let bound = token.raw().to_string();
        let result = execute_with_retry("commit_log_prune_since", || async {
            sqlx::query("DELETE FROM commit_log WHERE CAST(token AS INTEGER) >= CAST(? AS INTEGER)")
                .bind(&bound)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    /// Retries on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    ///
    /// Flushes any dirty tokens and checkpoints WAL before closing.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) => {
                    if count > 0 {
                        info!(count, "Flushed dirty acked tokens on close");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to flush dirty acked tokens on close");
                }
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}
