// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document manager engine.
//!
//! The main orchestrator that ties together:
//! - Per-namespace coalescing lanes via [`lane::Lane`]
//! - Bulk dispatch via [`crate::dispatch::BulkDispatcher`]
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//! - Rollback via [`crate::commit_log::CommitLogTracker`]
//! - Full resynchronization via [`crate::resync::Resynchronizer`]
//!
//! # Architecture
//!
//! The engine manages the full replication lifecycle:
//! 1. Accepts change intents and coalesces them per (namespace, document)
//! 2. Flushes batched bulk operations on size and time triggers
//! 3. Records settled operations for commit-log rollback
//! 4. Handles graceful shutdown with in-flight batch draining

mod lane;
mod types;

pub use types::{
    ChangeIntent, EngineState, HealthCheck, NamespaceHealth, RollbackReport, ShutdownReport,
};

use crate::checkpoint::CheckpointStore;
use crate::circuit_breaker::StoreCircuit;
use crate::codec::DocumentCodec;
use crate::commit_log::{CommitLogTracker, Compensation};
use crate::config::DocManagerConfig;
use crate::dispatch::{BulkDispatcher, FatalItem};
use crate::error::{DocManagerError, Result};
use crate::metrics;
use crate::namespace::{Namespace, NamespaceMapper};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::resync::{ResyncReport, Resynchronizer};
use crate::store::{DocumentStore, ItemStatus, NoOpStore, StoreAction, StoreOp};
use crate::token::SequenceToken;
use futures::Stream;
use lane::{Lane, LaneContext};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// The main document manager.
///
/// Receives change intents from the host, coalesces them per namespace,
/// and keeps a searchable document store in sync with the upstream log.
///
/// # Store Integration
///
/// The engine is handed a [`DocumentStore`] implementation by the host.
/// We use it to:
/// - Apply batched writes (`bulk_write`)
/// - Sweep stale documents after a resync (`sweep_delete`)
///
/// We never read the store on the write path; compensations for rollback
/// are computed from the retained commit log instead.
pub struct DocManager<S: DocumentStore = NoOpStore> {
    config: DocManagerConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    store: Arc<S>,
    circuit: Arc<StoreCircuit>,
    dispatcher: Arc<BulkDispatcher<S>>,
    mapper: NamespaceMapper,
    commit_log: Arc<CommitLogTracker>,
    checkpoint: Arc<RwLock<Option<CheckpointStore>>>,
    rate_limiter: Option<Arc<RateLimiter>>,

    /// Shared context handed to every lane worker.
    lane_ctx: Arc<LaneContext<S>>,

    /// One lane per namespace, created on first intent.
    lanes: Arc<RwLock<HashMap<String, Arc<Lane>>>>,

    /// Shutdown signal for lane workers and background tasks.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Worker and background task handles.
    task_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl DocManager<NoOpStore> {
    /// Create an engine over the no-op store (for testing/standalone).
    pub fn new(config: DocManagerConfig) -> Self {
        Self::with_store(config, Arc::new(NoOpStore))
    }
}

impl<S: DocumentStore> DocManager<S> {
    /// Create an engine over a concrete store client.
    ///
    /// This is the primary constructor used by the host.
    pub fn with_store(config: DocManagerConfig, store: Arc<S>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let circuit = Arc::new(StoreCircuit::new());
        let codec = DocumentCodec::default();
        let dispatcher = Arc::new(BulkDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&circuit),
            codec.clone(),
            config.dispatch.retry_config(),
        ));
        let commit_log = Arc::new(CommitLogTracker::new(config.commit_log.retention()));
        let checkpoint: Arc<RwLock<Option<CheckpointStore>>> = Arc::new(RwLock::new(None));

        let rate_limiter = config.dispatch.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for dispatch"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let lane_ctx = Arc::new(LaneContext {
            dispatcher: Arc::clone(&dispatcher),
            codec: codec.clone(),
            commit_log: Arc::clone(&commit_log),
            checkpoint: Arc::clone(&checkpoint),
            bulkhead: Arc::new(Bulkhead::new(config.dispatch.max_concurrent_flushes)),
            rate_limiter: rate_limiter.clone(),
            buffer_config: config.buffer.clone(),
            dispatch_config: config.dispatch.clone(),
        });

        Self {
            config,
            state_tx,
            state_rx,
            store,
            circuit,
            dispatcher,
            mapper: NamespaceMapper::new(),
            commit_log,
            checkpoint,
            rate_limiter,
            lane_ctx,
            lanes: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
            task_handles: RwLock::new(Vec::new()),
        }
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Get a reference to the circuit breakers protecting the store.
    pub fn circuit(&self) -> &Arc<StoreCircuit> {
        &self.circuit
    }

    /// Start the engine.
    ///
    /// 1. Opens the checkpoint store (SQLite)
    /// 2. Restores the persisted commit-log window
    /// 3. Spawns the checkpoint flush task (debounced writes)
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(DocManagerError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            sqlite_path = %self.config.checkpoint.sqlite_path,
            "Starting document manager"
        );
        let _ = self.state_tx.send(EngineState::Starting);
        metrics::set_engine_state("Starting");

        let checkpoint = match CheckpointStore::new(&self.config.checkpoint.sqlite_path).await {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "Failed to open checkpoint store");
                let _ = self.state_tx.send(EngineState::Failed);
                metrics::set_engine_state("Failed");
                return Err(e);
            }
        };

        // Restore the rollback window from the previous run
        let persisted = checkpoint.load_entries().await?;
        if !persisted.is_empty() {
            info!(entries = persisted.len(), "Restored commit-log window");
            self.commit_log.load(persisted).await;
        }

        *self.checkpoint.write().await = Some(checkpoint);
        self.spawn_checkpoint_flush_task().await;

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!("Document manager running");
        Ok(())
    }

    /// Accept one change intent.
    ///
    /// The intent is coalesced into its namespace's buffer; the actual
    /// store write happens asynchronously on a flush trigger. An id that
    /// cannot be canonicalized is rejected here, before it can poison a
    /// batch.
    pub async fn apply(&self, intent: ChangeIntent) -> Result<()> {
        if self.state() != EngineState::Running {
            return Err(DocManagerError::InvalidState {
                expected: "Running".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let ns = intent.namespace.to_string();
        let id = DocumentCodec::canonical_id(&intent.id).map_err(|e| {
            metrics::record_error(&ns, "malformed_document");
            DocManagerError::malformed(ns.clone(), intent.id.to_string(), e.to_string())
        })?;

        let lane = self.ensure_lane(&intent.namespace).await;
        let (pending, pending_bytes, coalesced) = {
            let mut buffer = lane.buffer.lock().await;
            let before = buffer.len();
            buffer.enqueue(crate::buffer::BufferedOperation {
                id,
                kind: intent.op,
                token: intent.token,
            });
            (buffer.len(), buffer.total_bytes(), buffer.len() == before)
        };

        metrics::record_intents_received(&ns, 1);
        if coalesced {
            metrics::record_intents_coalesced(&ns, 1);
        }
        metrics::set_buffer_pending(&ns, pending);
        metrics::set_buffer_bytes(&ns, pending_bytes);

        if pending >= self.config.buffer.max_pending
            || pending_bytes >= self.config.buffer.max_pending_bytes
        {
            lane.notify.notify_one();
        }
        Ok(())
    }

    /// Last confirmed token for a namespace, if anything was ever acked.
    pub async fn last_acked_token(&self, namespace: &Namespace) -> Option<SequenceToken> {
        let guard = self.checkpoint.read().await;
        match guard.as_ref() {
            Some(checkpoint) => checkpoint.get(&namespace.to_string()).await,
            None => None,
        }
    }

    /// Undo every confirmed operation with `token >= since` by applying
    /// the recorded compensations, newest first.
    ///
    /// Fails with [`DocManagerError::RollbackWindowExceeded`] when `since`
    /// predates the retained window; the host falls back to a full resync.
    /// All lanes are paused for the duration.
    pub async fn rollback(&self, since: SequenceToken) -> Result<RollbackReport> {
        if self.state() != EngineState::Running {
            return Err(DocManagerError::InvalidState {
                expected: "Running".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let started = Instant::now();
        info!(since = %since, "Starting rollback");

        let lanes: Vec<Arc<Lane>> = self.lanes.read().await.values().cloned().collect();
        for lane in &lanes {
            lane.set_paused(true);
        }
        // A dispatch already in flight when the pause went up settles and
        // records its batch before we read the commit log; holding each
        // flush lock once is the barrier
        for lane in &lanes {
            drop(lane.flush_lock.lock().await);
        }
        // Pending operations at or past the rollback point must not land
        // after the compensations; the host redelivers them
        for lane in &lanes {
            let mut buffer = lane.buffer.lock().await;
            let all = buffer.drain(usize::MAX, usize::MAX);
            let keep: Vec<_> = all.into_iter().filter(|op| op.token < since).collect();
            buffer.requeue_front(keep);
        }

        let result = self.apply_compensations(since).await;

        for lane in &lanes {
            lane.set_paused(false);
        }

        let (undone, restored, deleted, missing, failed) = result?;
        let duration = started.elapsed();
        metrics::record_rollback(restored, deleted, missing, duration);

        // Undone history is gone from both windows
        self.commit_log.prune_through(since).await;
        {
            let guard = self.checkpoint.read().await;
            if let Some(checkpoint) = guard.as_ref() {
                if let Err(e) = checkpoint.prune_entries_since(since).await {
                    warn!(error = %e, "Failed to prune persisted commit log after rollback");
                }
            }
        }

        info!(
            since = %since,
            undone,
            restored,
            deleted,
            missing,
            failed = failed.len(),
            "Rollback complete"
        );
        Ok(RollbackReport {
            since,
            undone,
            restored,
            deleted,
            missing,
            failed,
            duration,
        })
    }

    /// Apply the compensations for `token >= since`, newest first, batched
    /// into consecutive same-index bulk calls.
    async fn apply_compensations(
        &self,
        since: SequenceToken,
    ) -> Result<(usize, usize, usize, usize, Vec<FatalItem>)> {
        enum CompKind {
            Restore,
            Delete,
        }

        let entries = self.commit_log.undo_since(since).await?;
        let undone = entries.len();
        let mut restored = 0usize;
        let mut deleted = 0usize;
        let mut missing = 0usize;
        let mut failed: Vec<FatalItem> = Vec::new();

        let mut chunk_index: Option<String> = None;
        let mut chunk: Vec<(CompKind, SequenceToken, StoreAction)> = Vec::new();

        // Flushes one chunk of compensations against one index, through
        // the same circuit-protected retried call as forward writes
        async fn settle_chunk<S2: DocumentStore>(
            dispatcher: &BulkDispatcher<S2>,
            index: &str,
            chunk: Vec<(CompKind, SequenceToken, StoreAction)>,
            restored: &mut usize,
            deleted: &mut usize,
            failed: &mut Vec<FatalItem>,
        ) -> Result<()> {
            let actions: Vec<StoreAction> = chunk.iter().map(|(_, _, a)| a.clone()).collect();
            let statuses = dispatcher.bulk_call(index, actions).await?;
            for ((kind, token, action), status) in chunk.into_iter().zip(statuses) {
                match status {
                    ItemStatus::Ok => match kind {
                        CompKind::Restore => *restored += 1,
                        CompKind::Delete => *deleted += 1,
                    },
                    ItemStatus::Retryable(cause) | ItemStatus::Fatal(cause) => {
                        failed.push(FatalItem {
                            index: index.to_string(),
                            id: action.id,
                            token,
                            cause,
                        });
                    }
                }
            }
            Ok(())
        }

        for entry in entries {
            let (kind, op) = match entry.compensation {
                Compensation::Restore(doc) => (CompKind::Restore, StoreOp::Index(doc)),
                Compensation::Delete => (CompKind::Delete, StoreOp::Delete),
                Compensation::MarkMissing => {
                    warn!(
                        index = %entry.index,
                        doc_id = %entry.doc_id,
                        token = %entry.token,
                        "No recoverable prior state for rollback"
                    );
                    missing += 1;
                    continue;
                }
            };
            let action = StoreAction {
                id: entry.doc_id.clone(),
                op,
            };

            let same_index = chunk_index.as_deref() == Some(entry.index.as_str());
            if (!same_index || chunk.len() >= self.config.dispatch.max_batch_items)
                && !chunk.is_empty()
            {
                let index = chunk_index
                    .take()
                    .unwrap_or_else(|| unreachable!("chunk is non-empty"));
                settle_chunk(
                    &self.dispatcher,
                    &index,
                    std::mem::take(&mut chunk),
                    &mut restored,
                    &mut deleted,
                    &mut failed,
                )
                .await?;
            }
            chunk_index = Some(entry.index.clone());
            chunk.push((kind, entry.token, action));
        }
        if let Some(index) = chunk_index {
            if !chunk.is_empty() {
                settle_chunk(
                    &self.dispatcher,
                    &index,
                    chunk,
                    &mut restored,
                    &mut deleted,
                    &mut failed,
                )
                .await?;
            }
        }

        Ok((undone, restored, deleted, missing, failed))
    }

    /// Rebuild one namespace's index from an authoritative snapshot.
    ///
    /// The namespace's lane is paused for the duration; intents keep
    /// accumulating and flush once the pass finishes.
    pub async fn resync<St>(&self, namespace: &Namespace, snapshot: St) -> Result<ResyncReport>
    where
        St: Stream<Item = (Value, Map<String, Value>)> + Unpin,
    {
        if self.state() != EngineState::Running {
            return Err(DocManagerError::InvalidState {
                expected: "Running".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let lane = self.ensure_lane(namespace).await;
        lane.set_paused(true);
        // Wait out a flush already in flight: a pre-pause batch carries no
        // epoch tag, and the trailing sweep would destroy it if it landed
        // mid-pass
        drop(lane.flush_lock.lock().await);

        let resync = Resynchronizer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.circuit),
            self.config.dispatch.retry_config(),
            self.config.resync.clone(),
            self.rate_limiter.clone(),
        );
        let result = resync.run(namespace, &lane.mapping, snapshot).await;

        lane.set_paused(false);
        result
    }

    /// Get comprehensive health status for monitoring endpoints.
    ///
    /// Performs no store I/O; everything is read from cached internal
    /// state (atomics, mutexes, watch channels).
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let circuit_open = self.circuit.any_open();

        let lanes: Vec<Arc<Lane>> = self.lanes.read().await.values().cloned().collect();
        let mut namespaces = Vec::with_capacity(lanes.len());
        let mut buffered_total = 0;
        let checkpoint_guard = self.checkpoint.read().await;
        for lane in &lanes {
            let ns = lane.namespace.to_string();
            let (pending, pending_bytes) = {
                let buffer = lane.buffer.lock().await;
                (buffer.len(), buffer.total_bytes())
            };
            buffered_total += pending;
            let acked = match checkpoint_guard.as_ref() {
                Some(checkpoint) => checkpoint.get(&ns).await,
                None => None,
            };
            namespaces.push(NamespaceHealth {
                namespace: ns,
                pending,
                pending_bytes,
                paused: lane.is_paused(),
                acked,
            });
        }
        let checkpoint_dirty = match checkpoint_guard.as_ref() {
            Some(checkpoint) => checkpoint.dirty_count().await,
            None => 0,
        };
        drop(checkpoint_guard);

        let ready = state == EngineState::Running;
        HealthCheck {
            state,
            ready,
            healthy: ready && !circuit_open,
            circuit_open,
            buffered_total,
            commit_log_entries: self.commit_log.len().await,
            checkpoint_dirty,
            namespaces,
        }
    }

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal all lane workers to stop; each drains its buffer
    /// 2. Wait for workers with a grace timeout
    /// 3. Flush acked tokens and checkpoint the SQLite WAL
    ///
    /// The report names anything that did not settle; the host redelivers
    /// from the acked tokens on the next run.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down document manager");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);
        for lane in self.lanes.read().await.values() {
            lane.notify.notify_one();
        }

        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for lanes to drain and complete");
        }

        let mut drained = true;
        let grace = std::time::Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    drained = false;
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    drained = false;
                    warn!(task = i + 1, "Task timed out during shutdown (batch may be unflushed)");
                }
            }
        }

        let mut unflushed = HashMap::new();
        for lane in self.lanes.read().await.values() {
            let pending = lane.buffer.lock().await.len();
            if pending > 0 {
                unflushed.insert(lane.namespace.to_string(), pending);
            }
        }

        let mut acked = HashMap::new();
        if let Some(checkpoint) = self.checkpoint.write().await.take() {
            for (ns, token) in checkpoint.get_all().await {
                acked.insert(ns, token);
            }
            checkpoint.close().await;
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!(
            drained,
            unflushed = unflushed.len(),
            "Document manager stopped"
        );

        ShutdownReport {
            drained,
            unflushed,
            acked,
        }
    }

    /// Get or create the lane (buffer + worker) for a namespace.
    async fn ensure_lane(&self, namespace: &Namespace) -> Arc<Lane> {
        let key = namespace.to_string();
        if let Some(lane) = self.lanes.read().await.get(&key) {
            return Arc::clone(lane);
        }

        let mut lanes = self.lanes.write().await;
        // Double-check under the write lock
        if let Some(lane) = lanes.get(&key) {
            return Arc::clone(lane);
        }

        let mut mapping = self.mapper.map(namespace);
        mapping.index = self.config.prefixed_index(&mapping.index);
        let lane = Arc::new(Lane::new(namespace.clone(), mapping));
        lanes.insert(key.clone(), Arc::clone(&lane));

        let handle = tokio::spawn(lane::run_lane(
            Arc::clone(&lane),
            Arc::clone(&self.lane_ctx),
            self.shutdown_rx.clone(),
        ));
        self.task_handles.write().await.push(handle);
        info!(namespace = %key, index = %lane.mapping.index, "Created namespace lane");
        lane
    }

    /// Spawn the checkpoint flush task for debounced token writes.
    ///
    /// Also trims the persisted commit log to the retained in-memory
    /// window, so the SQLite file stays bounded.
    async fn spawn_checkpoint_flush_task(&self) {
        let checkpoint = Arc::clone(&self.checkpoint);
        let commit_log = Arc::clone(&self.commit_log);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.checkpoint.flush_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let guard = checkpoint.read().await;
                        if let Some(store) = guard.as_ref() {
                            if let Err(e) = store.flush_dirty().await {
                                warn!(error = %e, "Failed to flush acked tokens");
                            }
                            if let Some(oldest) = commit_log.oldest_token().await {
                                if let Err(e) = store.prune_entries_before(oldest).await {
                                    warn!(error = %e, "Failed to trim persisted commit log");
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned checkpoint flush task");
        self.task_handles.write().await.push(handle);
    }
}
