// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk dispatcher: drained batches to store bulk calls.
//!
//! Turns a frozen batch of coalesced operations into one bulk call,
//! classifies the per-item results, and retries the retryable subset with
//! bounded backoff. A poisoned document becomes a reported fatal and never
//! blocks the items behind it.
//!
//! # Failure handling
//!
//! - **Per-item fatal**: reported in the outcome; the rest of the batch
//!   proceeds.
//! - **Per-item retryable**: re-dispatched in shrinking sub-batches; items
//!   still failing when the retry budget runs out become fatal.
//! - **Whole-call failure** (timeout, connection refused, circuit open):
//!   retried with backoff; exhaustion surfaces as `StoreUnavailable` and
//!   the caller requeues the entire batch. Operations are idempotent, so
//!   requeuing items a half-applied call already wrote is safe.

use crate::buffer::{BufferedOperation, OperationKind};
use crate::circuit_breaker::{CircuitError, StoreCircuit};
use crate::codec::{DocumentCodec, StoreDocument};
use crate::error::{DocManagerError, Result};
use crate::metrics;
use crate::namespace::IndexMapping;
use crate::resilience::RetryConfig;
use crate::store::{DocumentStore, ItemStatus, StoreAction, StoreOp};
use crate::token::SequenceToken;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

/// One document the store will never accept.
#[derive(Debug, Clone)]
pub struct FatalItem {
    pub index: String,
    pub id: String,
    pub token: SequenceToken,
    pub cause: String,
}

/// Result of dispatching one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Items in the dispatched batch (after the final per-id dedupe).
    pub total: usize,
    /// Operations the store applied, in dispatch order.
    pub succeeded: Vec<BufferedOperation>,
    /// Documents the store rejected permanently.
    pub fatal: Vec<FatalItem>,
    /// Per-item retry rounds that were needed.
    pub retried: usize,
    /// Highest token in the batch; the ack point once the batch settles.
    pub max_token: Option<SequenceToken>,
}

impl BatchOutcome {
    /// Check if every item was applied.
    pub fn is_clean(&self) -> bool {
        self.fatal.is_empty()
    }
}

/// Dispatches batches of coalesced operations to the document store.
pub struct BulkDispatcher<S: DocumentStore> {
    store: Arc<S>,
    circuit: Arc<StoreCircuit>,
    codec: DocumentCodec,
    retry: RetryConfig,
}

impl<S: DocumentStore> BulkDispatcher<S> {
    pub fn new(
        store: Arc<S>,
        circuit: Arc<StoreCircuit>,
        codec: DocumentCodec,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            circuit,
            codec,
            retry,
        }
    }

    /// Dispatch one batch against one index.
    ///
    /// Returns the settled outcome, or `StoreUnavailable` when the store
    /// never answered; in that case nothing is considered settled and the
    /// caller requeues the batch.
    #[instrument(skip(self, batch), fields(index = %mapping.index, items = batch.len()))]
    pub async fn flush(
        &self,
        mapping: &IndexMapping,
        batch: Vec<BufferedOperation>,
    ) -> Result<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let started = Instant::now();
        let batch = dedupe_last_wins(batch, &mapping.index);
        let max_token = batch.iter().map(|op| op.token).max();

        let mut pending: Vec<(BufferedOperation, StoreAction)> = batch
            .into_iter()
            .map(|op| {
                let action = self.build_action(&op);
                (op, action)
            })
            .collect();

        let mut outcome = BatchOutcome {
            total: pending.len(),
            max_token,
            ..Default::default()
        };

        // Per-item retry rounds; each round is one (whole-call-retried)
        // bulk call over the still-retryable subset
        let mut round = 0;
        while !pending.is_empty() {
            round += 1;
            let actions: Vec<StoreAction> = pending.iter().map(|(_, a)| a.clone()).collect();
            let statuses = self.bulk_call(&mapping.index, actions).await?;

            if statuses.len() != pending.len() {
                return Err(DocManagerError::Internal(format!(
                    "store returned {} statuses for {} actions",
                    statuses.len(),
                    pending.len()
                )));
            }

            let mut retry_next = Vec::new();
            for ((op, action), status) in pending.into_iter().zip(statuses) {
                match status {
                    ItemStatus::Ok => outcome.succeeded.push(op),
                    ItemStatus::Fatal(cause) => {
                        warn!(
                            index = %mapping.index,
                            id = %op.id,
                            cause = %cause,
                            "Store rejected document"
                        );
                        outcome.fatal.push(FatalItem {
                            index: mapping.index.clone(),
                            id: op.id.clone(),
                            token: op.token,
                            cause,
                        });
                    }
                    ItemStatus::Retryable(cause) => {
                        if round >= self.retry.max_attempts {
                            outcome.fatal.push(FatalItem {
                                index: mapping.index.clone(),
                                id: op.id.clone(),
                                token: op.token,
                                cause: format!("retry budget exhausted: {cause}"),
                            });
                        } else {
                            retry_next.push((op, action));
                        }
                    }
                }
            }

            pending = retry_next;
            if !pending.is_empty() {
                outcome.retried += 1;
                debug!(
                    index = %mapping.index,
                    items = pending.len(),
                    round,
                    "Retrying retryable subset"
                );
                sleep(self.retry.delay_for_attempt(round)).await;
            }
        }

        metrics::record_flush(
            &mapping.index,
            outcome.total,
            outcome.succeeded.len(),
            outcome.fatal.len(),
            outcome.retried,
            started.elapsed(),
        );
        info!(
            index = %mapping.index,
            total = outcome.total,
            succeeded = outcome.succeeded.len(),
            fatal = outcome.fatal.len(),
            retried = outcome.retried,
            "Batch dispatch complete"
        );

        Ok(outcome)
    }

    /// One bulk call through the circuit breaker, with whole-call retries.
    ///
    /// Also used for writes issued outside the batch path (rollback
    /// compensations), so those get the same protection.
    pub(crate) async fn bulk_call(
        &self,
        index: &str,
        actions: Vec<StoreAction>,
    ) -> Result<Vec<ItemStatus>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = self
                .circuit
                .writes
                .call(|| self.store.bulk_write(index, actions.clone()));

            let failure = match timeout(self.retry.call_timeout, call).await {
                Ok(Ok(statuses)) => return Ok(statuses),
                Ok(Err(CircuitError::Rejected)) => "circuit open".to_string(),
                Ok(Err(CircuitError::Inner(e))) => e.to_string(),
                Err(_) => format!("bulk call timed out after {:?}", self.retry.call_timeout),
            };

            if attempt >= self.retry.max_attempts {
                metrics::record_batch_requeued(index, actions.len());
                warn!(
                    index = %index,
                    attempts = attempt,
                    last_error = %failure,
                    "Store unavailable, giving up on batch"
                );
                return Err(DocManagerError::StoreUnavailable {
                    index: index.to_string(),
                    attempts: attempt,
                });
            }

            let delay = self.retry.delay_for_attempt(attempt);
            metrics::record_store_retry("bulk_write");
            debug!(
                index = %index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Bulk call failed, backing off"
            );
            sleep(delay).await;
        }
    }

    fn build_action(&self, op: &BufferedOperation) -> StoreAction {
        let store_op = match &op.kind {
            OperationKind::Upsert(fields) => {
                // Keys were kept upstream-shaped while buffered; escape at
                // the store boundary
                let encoded = self
                    .codec
                    .encode(&serde_json::Value::String(op.id.clone()), fields)
                    .unwrap_or_else(|_| StoreDocument {
                        id: op.id.clone(),
                        fields: fields.clone(),
                        token: None,
                    });
                StoreOp::Index(StoreDocument {
                    token: Some(op.token),
                    ..encoded
                })
            }
            OperationKind::PartialUpdate(spec) => StoreOp::Update(self.codec.encode_update(spec)),
            OperationKind::Delete => StoreOp::Delete,
        };
        StoreAction {
            id: op.id.clone(),
            op: store_op,
        }
    }
}

/// Enforce the single-item-per-id invariant as a last line of defense.
///
/// The buffer already coalesces; a duplicate here is a data-quality signal
/// worth logging, not a reason to fail the batch.
fn dedupe_last_wins(batch: Vec<BufferedOperation>, index: &str) -> Vec<BufferedOperation> {
    let mut last_for_id: HashMap<String, usize> = HashMap::with_capacity(batch.len());
    for (pos, op) in batch.iter().enumerate() {
        if last_for_id.insert(op.id.clone(), pos).is_some() {
            warn!(index = %index, id = %op.id, "Duplicate id in dispatched batch, keeping last");
        }
    }
    if last_for_id.len() == batch.len() {
        return batch;
    }
    batch
        .into_iter()
        .enumerate()
        .filter(|(pos, op)| last_for_id.get(&op.id) == Some(pos))
        .map(|(_, op)| op)
        .collect()
}
