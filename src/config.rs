//! Configuration for the document manager.
//!
//! This module defines all configuration types needed to run the engine.
//! Configuration is passed to [`DocManager::new()`](crate::DocManager::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use doc_manager::config::DocManagerConfig;
//!
//! let config = DocManagerConfig {
//!     index_prefix: Some("app_".into()),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! DocManagerConfig
//! ├── index_prefix: Option<String>   # Prepended to derived index names
//! ├── buffer: BufferConfig           # Coalescing buffer and flush triggers
//! ├── dispatch: DispatchConfig       # Bulk batching, retry, rate limiting
//! ├── commit_log: CommitLogConfig    # Rollback window retention
//! ├── resync: ResyncConfig           # Epoch-tag full resynchronization
//! └── checkpoint: CheckpointConfig   # SQLite acked-token persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! index_prefix: "app_"
//!
//! buffer:
//!   max_pending: 500
//!   max_pending_bytes: 5242880
//!   flush_interval: "1s"
//!
//! dispatch:
//!   max_batch_items: 500
//!   max_attempts: 5
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/app/checkpoints.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from the host to DocManager::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `DocManager::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocManagerConfig {
    /// Optional prefix prepended to every derived index name.
    /// Lets several deployments share one store without colliding.
    #[serde(default)]
    pub index_prefix: Option<String>,

    /// Coalescing buffer settings (flush triggers).
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Bulk dispatch settings (batch bounds, retry, rate limiting).
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Commit-log retention (bounds the rollback window).
    #[serde(default)]
    pub commit_log: CommitLogConfig,

    /// Full-resynchronization settings.
    #[serde(default)]
    pub resync: ResyncConfig,

    /// Acked-token persistence settings.
    /// Tokens are stored in SQLite for crash recovery.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for DocManagerConfig {
    fn default() -> Self {
        Self {
            index_prefix: None,
            buffer: BufferConfig::default(),
            dispatch: DispatchConfig::default(),
            commit_log: CommitLogConfig::default(),
            resync: ResyncConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl DocManagerConfig {
    /// Create a config with tight timings for testing.
    ///
    /// `sqlite_path` should point inside a test-owned temp directory.
    pub fn for_testing(sqlite_path: &str) -> Self {
        Self {
            index_prefix: None,
            buffer: BufferConfig {
                max_pending: 10,
                max_pending_bytes: 64 * 1024,
                flush_interval: "20ms".to_string(),
            },
            dispatch: DispatchConfig {
                max_batch_items: 10,
                max_batch_bytes: 64 * 1024,
                max_attempts: 3,
                call_timeout: "2s".to_string(),
                max_concurrent_flushes: 2,
                rate_limit_enabled: false,
                rate_limit_per_sec: 10_000,
                rate_limit_burst: 1000,
            },
            commit_log: CommitLogConfig {
                max_entries: 100,
                max_age: "10m".to_string(),
            },
            resync: ResyncConfig::default(),
            checkpoint: CheckpointConfig {
                sqlite_path: sqlite_path.to_string(),
                flush_interval: "50ms".to_string(),
            },
        }
    }

    /// Apply the configured prefix to a derived index name.
    pub fn prefixed_index(&self, index: &str) -> String {
        match &self.index_prefix {
            Some(prefix) => format!("{}{}", prefix, index),
            None => index.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BufferConfig: coalescing buffer flush triggers
// ═══════════════════════════════════════════════════════════════════════════════

/// Coalescing buffer configuration.
///
/// A namespace's buffer flushes when it holds `max_pending` operations,
/// when its estimated payload reaches `max_pending_bytes`, or when
/// `flush_interval` elapses with anything pending, whichever comes first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Pending-operation count that triggers an immediate flush.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Estimated buffered bytes that trigger an immediate flush.
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,

    /// Time-based flush trigger as a duration string (e.g., "1s").
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_max_pending() -> usize {
    500
}

fn default_max_pending_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_flush_interval() -> String {
    "1s".to_string()
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_pending: 500,
            max_pending_bytes: 5 * 1024 * 1024,
            flush_interval: "1s".to_string(),
        }
    }
}

impl BufferConfig {
    /// Parse the flush_interval string to a Duration.
    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchConfig: bulk batching, retry, rate limiting
// ═══════════════════════════════════════════════════════════════════════════════

/// Bulk dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum operations per bulk call.
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,

    /// Maximum estimated payload bytes per bulk call.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Retry budget for both whole-call failures and per-item retryable
    /// failures before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Per-bulk-call timeout as a duration string (e.g., "10s").
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,

    /// Maximum bulk calls in flight across all namespaces.
    #[serde(default = "default_max_concurrent_flushes")]
    pub max_concurrent_flushes: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (protects the store during resync/catch-up storms)
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting for dispatched operations.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum operations per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_batch_items() -> usize {
    500
}

fn default_max_batch_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_max_attempts() -> usize {
    5
}

fn default_call_timeout() -> String {
    "10s".to_string()
}

fn default_max_concurrent_flushes() -> usize {
    8
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

fn default_false() -> bool {
    false
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_batch_items: 500,
            max_batch_bytes: 5 * 1024 * 1024,
            max_attempts: 5,
            call_timeout: "10s".to_string(),
            max_concurrent_flushes: 8,
            rate_limit_enabled: false,
            rate_limit_per_sec: 10_000,
            rate_limit_burst: 1000,
        }
    }
}

impl DispatchConfig {
    /// Parse the call_timeout string to a Duration.
    pub fn call_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.call_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Build the retry policy for bulk dispatch from these settings.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig {
            max_attempts: self.max_attempts,
            call_timeout: self.call_timeout_duration(),
            ..crate::resilience::RetryConfig::dispatch()
        }
    }

    /// Create rate limit configuration from dispatch settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CommitLogConfig: rollback window retention
// ═══════════════════════════════════════════════════════════════════════════════

/// Commit-log retention configuration.
///
/// The retained window bounds how far back `rollback()` can reach.
/// Entries are evicted once either bound is exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitLogConfig {
    /// Maximum retained entries.
    #[serde(default = "default_commit_log_max_entries")]
    pub max_entries: usize,

    /// Maximum entry age as a duration string (e.g., "1h").
    #[serde(default = "default_commit_log_max_age")]
    pub max_age: String,
}

fn default_commit_log_max_entries() -> usize {
    10_000
}

fn default_commit_log_max_age() -> String {
    "1h".to_string()
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_age: "1h".to_string(),
        }
    }
}

impl CommitLogConfig {
    /// Parse the max_age string to a Duration.
    pub fn max_age_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_age).unwrap_or(Duration::from_secs(3600))
    }

    /// Build the tracker retention policy from these settings.
    pub fn retention(&self) -> crate::commit_log::RetentionConfig {
        crate::commit_log::RetentionConfig {
            max_entries: self.max_entries,
            max_age: self.max_age_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ResyncConfig: epoch-tag full resynchronization
// ═══════════════════════════════════════════════════════════════════════════════

/// Full-resynchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Documents per bulk upsert batch during resync.
    #[serde(default = "default_resync_batch_size")]
    pub batch_size: usize,

    /// Field name stamped with the resync epoch on every upserted document.
    /// Documents still carrying an older epoch after the pass are swept.
    #[serde(default = "default_epoch_field")]
    pub epoch_field: String,

    /// Whether to sweep stale-epoch documents after the pass.
    #[serde(default = "default_true")]
    pub sweep_stale: bool,
}

fn default_resync_batch_size() -> usize {
    500
}

fn default_epoch_field() -> String {
    "sync_epoch".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            epoch_field: "sync_epoch".to_string(),
            sweep_stale: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: acked-token persistence (internal, not from host)
// ═══════════════════════════════════════════════════════════════════════════════

/// Acked-token persistence configuration.
///
/// Acked tokens track the last confirmed position per namespace. We
/// persist to SQLite so a restart resumes from the right position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage.
    pub sqlite_path: String,

    /// Debounce interval for persisting dirty tokens, as a duration
    /// string (e.g., "3s").
    #[serde(default = "default_checkpoint_flush_interval")]
    pub flush_interval: String,
}

fn default_checkpoint_flush_interval() -> String {
    "3s".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "doc_manager_checkpoints.db".to_string(),
            flush_interval: "3s".to_string(),
        }
    }
}

impl CheckpointConfig {
    /// Parse the flush_interval string to a Duration.
    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(3))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
