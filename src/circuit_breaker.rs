//! Circuit breaker pattern for document store protection.
//!
//! Prevents cascading failures when the store is overloaded or unhealthy.
//! Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, bulk calls pass through
//! - **Open**: Store unhealthy, calls fail-fast without attempting
//! - **HalfOpen**: Testing if the store recovered, limited calls allowed
//!
//! # Usage
//!
//! ```rust,no_run
//! # use doc_manager::circuit_breaker::{StoreCircuit, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = StoreCircuit::new();
//!
//! // Wrap store write calls
//! match circuit.writes.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, backoff */ }
//!     Err(CircuitError::Inner(e)) => { /* store error */ }
//! }
//! # Ok(())
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker state for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if service recovered
    HalfOpen = 1,
    /// Service unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Check if this is a rejection (circuit open).
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips faster and recovers cautiously.
    ///
    /// Use this for bulk writes where hammering a struggling store only
    /// deepens the outage.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Fast recovery for testing.
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Get the circuit breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                debug!(circuit = %self.name, "Circuit call succeeded");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "rejected");
                crate::metrics::set_circuit_state(&self.name, "open");
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Get total number of calls.
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors).
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Check if circuit is likely open (based on recent rejections).
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }

    /// Reset all counters.
    pub fn reset_counters(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}

/// Circuit breakers for document store operations.
///
/// Wraps store calls with circuit breaker protection so a struggling
/// store gets breathing room instead of a retry storm.
pub struct StoreCircuit {
    /// Circuit for write operations (bulk_write, sweep_delete)
    pub writes: CircuitBreaker,
    /// Circuit for read operations (get)
    pub reads: CircuitBreaker,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCircuit {
    /// Create store circuits with appropriate configs.
    pub fn new() -> Self {
        Self {
            // Writes: aggressive (don't hammer the store when struggling)
            writes: CircuitBreaker::new("store_writes", CircuitConfig::aggressive()),
            // Reads: gets can tolerate more failures
            reads: CircuitBreaker::new("store_reads", CircuitConfig::default()),
        }
    }

    /// Create with custom configs.
    pub fn with_configs(writes_config: CircuitConfig, reads_config: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new("store_writes", writes_config),
            reads: CircuitBreaker::new("store_reads", reads_config),
        }
    }

    /// Check if any circuit is open.
    pub fn any_open(&self) -> bool {
        self.writes.is_likely_open() || self.reads.is_likely_open()
    }
}
