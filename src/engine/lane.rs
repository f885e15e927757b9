// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-namespace flush lane.
//!
//! Each namespace gets one lane: a coalescing buffer plus a worker task
//! that drains it into bulk store calls. The worker wakes on a size
//! trigger (via [`Notify`]), on a flush-interval tick, and on shutdown,
//! where it drains whatever is left.
//!
//! A settled batch is recorded in the commit log and advances the acked
//! token. A batch the store never answered is requeued at the front of
//! the buffer and retried on the next wakeup; coalescing keeps the
//! requeued operations correct if fresh intents arrived meanwhile.

use crate::buffer::{BufferedOperation, OperationBuffer, OperationKind};
use crate::checkpoint::CheckpointStore;
use crate::codec::DocumentCodec;
use crate::commit_log::{AppliedOp, CommitLogTracker};
use crate::config::{BufferConfig, DispatchConfig};
use crate::dispatch::BulkDispatcher;
use crate::error::DocManagerError;
use crate::namespace::{IndexMapping, Namespace};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::store::DocumentStore;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, error, warn};

/// One namespace's buffer and flush coordination state.
pub(crate) struct Lane {
    pub namespace: Namespace,
    pub mapping: IndexMapping,
    pub buffer: Mutex<OperationBuffer>,
    /// Wakes the worker when a size trigger fires.
    pub notify: Notify,
    /// Set while a resync or rollback owns the lane.
    pub paused: AtomicBool,
    /// Held across one drain-dispatch-record round. Rollback and resync
    /// pause the lane, then acquire this to wait out a dispatch that was
    /// already in flight when the pause flag went up.
    pub flush_lock: Mutex<()>,
}

impl Lane {
    pub fn new(namespace: Namespace, mapping: IndexMapping) -> Self {
        Self {
            namespace,
            mapping,
            buffer: Mutex::new(OperationBuffer::new()),
            notify: Notify::new(),
            paused: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        if !paused {
            // Anything buffered while paused flushes promptly
            self.notify.notify_one();
        }
    }
}

/// Everything a lane worker needs, shared across lanes.
pub(crate) struct LaneContext<S: DocumentStore> {
    pub dispatcher: Arc<BulkDispatcher<S>>,
    pub codec: DocumentCodec,
    pub commit_log: Arc<CommitLogTracker>,
    pub checkpoint: Arc<RwLock<Option<CheckpointStore>>>,
    pub bulkhead: Arc<Bulkhead>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub buffer_config: BufferConfig,
    pub dispatch_config: DispatchConfig,
}

/// Worker loop for one lane. Runs until shutdown, then drains.
pub(crate) async fn run_lane<S: DocumentStore>(
    lane: Arc<Lane>,
    ctx: Arc<LaneContext<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // First tick lands one full interval after start
    let period = ctx.buffer_config.flush_interval_duration();
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(namespace = %lane.namespace, "Lane worker started");

    loop {
        tokio::select! {
            _ = lane.notify.notified() => {}
            _ = timer.tick() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }

        if lane.is_paused() {
            continue;
        }
        flush_pending(&lane, &ctx).await;
    }

    // Shutdown: one last drain attempt for whatever is buffered
    flush_pending(&lane, &ctx).await;
    let remaining = lane.buffer.lock().await.len();
    if remaining > 0 {
        warn!(
            namespace = %lane.namespace,
            remaining,
            "Lane stopping with unflushed operations"
        );
    } else {
        debug!(namespace = %lane.namespace, "Lane worker stopped clean");
    }
}

/// Drain the lane's buffer into bulk calls until it is empty or the store
/// stops answering.
pub(crate) async fn flush_pending<S: DocumentStore>(lane: &Lane, ctx: &LaneContext<S>) {
    loop {
        let _flush = lane.flush_lock.lock().await;
        // The pause check must happen under the lock: a pause raised
        // mid-dispatch takes effect on the next round, and whoever raised
        // it waits on the lock until this round has recorded its batch
        if lane.is_paused() {
            break;
        }
        let batch = {
            let mut buffer = lane.buffer.lock().await;
            buffer.drain(
                ctx.dispatch_config.max_batch_items,
                ctx.dispatch_config.max_batch_bytes,
            )
        };
        if batch.is_empty() {
            break;
        }

        let permit = match ctx.bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                // Semaphore closed: engine is tearing down
                lane.buffer.lock().await.requeue_front(batch);
                break;
            }
        };
        if let Some(limiter) = &ctx.rate_limiter {
            limiter.acquire_many(batch.len() as u32).await;
        }

        let requeue = batch.clone();
        let result = ctx.dispatcher.flush(&lane.mapping, batch).await;
        drop(permit);

        match result {
            Ok(outcome) => {
                record_settled(lane, ctx, &outcome.succeeded).await;

                for _ in &outcome.fatal {
                    crate::metrics::record_error(&lane.namespace.to_string(), "fatal_document");
                }
                if !outcome.fatal.is_empty() {
                    warn!(
                        namespace = %lane.namespace,
                        fatal = outcome.fatal.len(),
                        "Batch settled with permanently rejected documents"
                    );
                }

                // Fatal items still advance the ack: retrying them can
                // never succeed, so holding the token back would wedge
                // the namespace
                if let Some(token) = outcome.max_token {
                    let guard = ctx.checkpoint.read().await;
                    if let Some(checkpoint) = guard.as_ref() {
                        checkpoint.set(&lane.namespace.to_string(), token).await;
                    }
                }
            }
            Err(DocManagerError::StoreUnavailable { index, attempts }) => {
                warn!(
                    namespace = %lane.namespace,
                    index = %index,
                    attempts,
                    requeued = requeue.len(),
                    "Store unavailable, requeueing batch"
                );
                lane.buffer.lock().await.requeue_front(requeue);
                break;
            }
            Err(e) => {
                error!(namespace = %lane.namespace, error = %e, "Batch flush failed, requeueing");
                crate::metrics::record_error(&lane.namespace.to_string(), "flush_error");
                lane.buffer.lock().await.requeue_front(requeue);
                break;
            }
        }

        update_gauges(lane).await;
    }
    update_gauges(lane).await;
}

/// Record settled operations in the commit log (memory and SQLite) and
/// update the entry gauge.
async fn record_settled<S: DocumentStore>(
    lane: &Lane,
    ctx: &LaneContext<S>,
    succeeded: &[BufferedOperation],
) {
    if succeeded.is_empty() {
        return;
    }

    let mut entries = Vec::with_capacity(succeeded.len());
    for op in succeeded {
        let applied = match &op.kind {
            OperationKind::Upsert(fields) => {
                match ctx.codec.encode(&Value::String(op.id.clone()), fields) {
                    Ok(mut doc) => {
                        doc.token = Some(op.token);
                        AppliedOp::Upsert(doc)
                    }
                    Err(e) => {
                        // The dispatcher already wrote this document; worst
                        // case its rollback entry degrades to MarkMissing
                        warn!(namespace = %lane.namespace, id = %op.id, error = %e, "Could not re-encode settled upsert for the commit log");
                        continue;
                    }
                }
            }
            OperationKind::PartialUpdate(spec) => AppliedOp::Update(ctx.codec.encode_update(spec)),
            OperationKind::Delete => AppliedOp::Delete,
        };
        let entry = ctx
            .commit_log
            .record(op.token, &lane.mapping.index, &op.id, applied)
            .await;
        entries.push(entry);
    }

    let guard = ctx.checkpoint.read().await;
    if let Some(checkpoint) = guard.as_ref() {
        if let Err(e) = checkpoint.append_entries(&entries).await {
            // In-memory window is still correct; persisted window catches
            // up on the next settled batch
            warn!(namespace = %lane.namespace, error = %e, "Failed to persist commit-log entries");
        }
    }
}

async fn update_gauges(lane: &Lane) {
    let buffer = lane.buffer.lock().await;
    let ns = lane.namespace.to_string();
    crate::metrics::set_buffer_pending(&ns, buffer.len());
    crate::metrics::set_buffer_bytes(&ns, buffer.total_bytes());
}
