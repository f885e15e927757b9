//! Resilience utilities: retry logic, backoff, rate limiting, bulkheads.
//!
//! This module provides patterns to protect the document store from
//! overload:
//!
//! - [`RetryConfig`]: Exponential backoff for transient store failures
//! - [`RateLimiter`]: Token bucket throttling the resync firehose
//! - [`Bulkhead`]: Semaphore to limit concurrent bulk dispatches
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), doc_manager::resilience::BulkheadFull> {
//! use doc_manager::resilience::{RateLimiter, Bulkhead, RateLimitConfig};
//!
//! // Rate limit: max 1000 docs/sec with burst of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! // Bulkhead: max 8 concurrent bulk calls across namespaces
//! let bulkhead = Bulkhead::new(8);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for store retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included).
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual store call.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Bounded retry for bulk dispatch.
    ///
    /// Gives a briefly unavailable store a few seconds to come back, then
    /// gives up so the batch can be requeued and the flush worker can back
    /// off instead of holding the lane lock.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay     Cumulative
    /// -------  -----     ----------
    /// 1        200ms     200ms
    /// 2        400ms     600ms
    /// 3        800ms     1.4s
    /// 4        1.6s      3s
    /// ```
    pub fn dispatch() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            call_timeout: Duration::from_secs(10),
        }
    }

    /// Infinite retry for a long-running replication daemon.
    ///
    /// Retries forever with exponential backoff capped at 5 minutes. A
    /// store outage of hours should not require a manual restart; the
    /// buffers hold the pending operations and delivery resumes when the
    /// store comes back.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    ///
    /// Fails quickly to avoid slow tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            call_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each operation consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 docs/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

impl RateLimitConfig {
    /// Gentle pace for resyncing against a store that is also serving
    /// queries.
    pub fn conservative() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 100,
        }
    }

    /// No rate limiting (unlimited).
    pub fn unlimited() -> Self {
        Self {
            burst_size: u32::MAX,
            refill_rate: u32::MAX,
        }
    }
}

/// Token bucket rate limiter.
///
/// A full resync replays every document of a collection; without a
/// throttle that replay starves the steady-state traffic of the other
/// namespaces. Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota =
            Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    ///
    /// Returns `true` if acquired, `false` if rate limit exceeded.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Acquire multiple permits at once.
    ///
    /// Used to charge a whole resync batch rather than each document.
    pub async fn acquire_many(&self, n: u32) {
        if n == 0 {
            return;
        }
        for _ in 0..n {
            self.limiter.until_ready().await;
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Bulkhead pattern: limits concurrent operations to prevent resource
/// exhaustion.
///
/// Each namespace lane flushes independently; the bulkhead caps how many
/// bulk calls can be in flight against the store across all of them.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Create a bulkhead for cross-namespace bulk dispatch.
    ///
    /// Default: 8 concurrent bulk calls.
    pub fn for_dispatch() -> Self {
        Self::new(8)
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Try to acquire a permit without waiting.
    ///
    /// Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the maximum concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Check if the bulkhead is full (no permits available).
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
