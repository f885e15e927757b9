// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Epoch-tag full resynchronization.
//!
//! Rebuilds one namespace's index from an authoritative snapshot without
//! taking the index offline. Every document upserted during the pass is
//! stamped with a fresh epoch value in a well-known field; once the
//! snapshot is exhausted, a single sweep deletes everything still carrying
//! an older epoch (or none). Readers see the index converge in place.
//!
//! The snapshot arrives as a stream of `(id, fields)` pairs so the caller
//! can page it out of the source of truth without materializing it.

use crate::buffer::{BufferedOperation, OperationKind};
use crate::circuit_breaker::{CircuitError, StoreCircuit};
use crate::codec::DocumentCodec;
use crate::config::ResyncConfig;
use crate::dispatch::{BulkDispatcher, FatalItem};
use crate::error::{DocManagerError, Result};
use crate::namespace::{IndexMapping, Namespace};
use crate::resilience::{RateLimiter, RetryConfig};
use crate::store::DocumentStore;
use crate::token::SequenceToken;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// What a resync pass accomplished.
#[derive(Debug)]
pub struct ResyncReport {
    pub namespace: Namespace,
    /// The epoch value stamped on every upserted document.
    pub epoch: String,
    /// Documents written from the snapshot.
    pub upserted: u64,
    /// Documents the store refused permanently.
    pub fatal: Vec<FatalItem>,
    /// Stale-epoch documents removed by the trailing sweep.
    pub swept: u64,
    pub duration: Duration,
}

impl ResyncReport {
    pub fn is_clean(&self) -> bool {
        self.fatal.is_empty()
    }
}

/// Drives one full-resynchronization pass over a namespace.
pub struct Resynchronizer<S: DocumentStore> {
    store: Arc<S>,
    dispatcher: Arc<BulkDispatcher<S>>,
    circuit: Arc<StoreCircuit>,
    retry: RetryConfig,
    config: ResyncConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl<S: DocumentStore> Resynchronizer<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<BulkDispatcher<S>>,
        circuit: Arc<StoreCircuit>,
        retry: RetryConfig,
        config: ResyncConfig,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            circuit,
            retry,
            config,
            rate_limiter,
        }
    }

    /// Run one pass: upsert every snapshot document stamped with a fresh
    /// epoch, then sweep documents still carrying an older epoch.
    ///
    /// A `StoreUnavailable` error aborts the pass; already-upserted
    /// documents keep the new epoch, so rerunning is safe.
    pub async fn run<St>(&self, namespace: &Namespace, mapping: &IndexMapping, mut snapshot: St) -> Result<ResyncReport>
    where
        St: Stream<Item = (Value, Map<String, Value>)> + Unpin,
    {
        let started = Instant::now();
        let now = chrono::Utc::now();
        let epoch = now.timestamp_millis().to_string();
        let epoch_secs = now.timestamp() as u32;

        info!(
            namespace = %namespace,
            index = %mapping.index,
            epoch = %epoch,
            "Starting full resynchronization"
        );

        let mut upserted: u64 = 0;
        let mut fatal: Vec<FatalItem> = Vec::new();
        let mut batch: Vec<BufferedOperation> = Vec::with_capacity(self.config.batch_size);
        // Snapshot items get synthetic tokens; they never advance acks.
        let mut ordinal: u32 = 0;

        while let Some((id, mut fields)) = snapshot.next().await {
            let id = match DocumentCodec::canonical_id(&id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Skipping snapshot document with bad id");
                    fatal.push(FatalItem {
                        index: mapping.index.clone(),
                        id: id.to_string(),
                        token: SequenceToken::zero(),
                        cause: e.to_string(),
                    });
                    continue;
                }
            };

            fields.insert(
                self.config.epoch_field.clone(),
                Value::String(epoch.clone()),
            );

            ordinal = ordinal.wrapping_add(1);
            batch.push(BufferedOperation {
                id,
                kind: OperationKind::Upsert(fields),
                token: SequenceToken::from_parts(epoch_secs, ordinal),
            });

            if batch.len() >= self.config.batch_size {
                let drained = std::mem::take(&mut batch);
                upserted += self.flush_batch(mapping, drained, &mut fatal).await?;
            }
        }

        if !batch.is_empty() {
            upserted += self.flush_batch(mapping, batch, &mut fatal).await?;
        }

        let swept = if self.config.sweep_stale {
            self.sweep_stale(&mapping.index, &epoch).await?
        } else {
            0
        };

        let duration = started.elapsed();
        crate::metrics::record_resync(
            &namespace.to_string(),
            upserted,
            fatal.len() as u64,
            swept,
            duration,
        );
        info!(
            namespace = %namespace,
            upserted,
            fatal = fatal.len(),
            swept,
            duration_ms = duration.as_millis() as u64,
            "Resynchronization complete"
        );

        Ok(ResyncReport {
            namespace: namespace.clone(),
            epoch,
            upserted,
            fatal,
            swept,
            duration,
        })
    }

    /// The trailing sweep through the writes circuit, with the same
    /// whole-call retry discipline as bulk dispatch. A transient sweep
    /// failure must not abort a pass whose upserts all landed.
    async fn sweep_stale(&self, index: &str, epoch: &str) -> Result<u64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = self
                .circuit
                .writes
                .call(|| self.store.sweep_delete(index, &self.config.epoch_field, epoch));

            let failure = match timeout(self.retry.call_timeout, call).await {
                Ok(Ok(swept)) => return Ok(swept),
                Ok(Err(CircuitError::Rejected)) => "circuit open".to_string(),
                Ok(Err(CircuitError::Inner(e))) => e.to_string(),
                Err(_) => format!("sweep timed out after {:?}", self.retry.call_timeout),
            };

            if attempt >= self.retry.max_attempts {
                warn!(
                    index = %index,
                    attempts = attempt,
                    last_error = %failure,
                    "Stale-epoch sweep failed, giving up"
                );
                return Err(DocManagerError::StoreUnavailable {
                    index: index.to_string(),
                    attempts: attempt,
                });
            }

            let delay = self.retry.delay_for_attempt(attempt);
            crate::metrics::record_store_retry("sweep_delete");
            debug!(
                index = %index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Sweep failed, backing off"
            );
            sleep(delay).await;
        }
    }

    async fn flush_batch(
        &self,
        mapping: &IndexMapping,
        batch: Vec<BufferedOperation>,
        fatal: &mut Vec<FatalItem>,
    ) -> Result<u64> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire_many(batch.len() as u32).await;
        }
        let outcome = self.dispatcher.flush(mapping, batch).await?;
        let applied = outcome.succeeded.len() as u64;
        fatal.extend(outcome.fatal);
        Ok(applied)
    }
}
