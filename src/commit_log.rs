// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit-log tracker: bounded history of applied operations for rollback.
//!
//! Every operation the store confirms is recorded together with a
//! *compensation*: the inverse action that undoes it. Compensations are
//! computed at record time from the most recent retained state for the
//! same document, so rolling back never requires reading the store.
//!
//! Retention is bounded by entry count and by age; rolling back past the
//! retained window is refused loudly ([`DocManagerError::RollbackWindowExceeded`]),
//! never silently truncated. The host falls back to a full resync in that
//! case.

use crate::codec::{StoreDocument, StoreUpdate};
use crate::error::{DocManagerError, Result};
use crate::token::SequenceToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// The inverse of one applied operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Compensation {
    /// Re-index the previous version of the document.
    Restore(StoreDocument),
    /// Delete the document (it did not exist in the retained window).
    Delete,
    /// Prior state was never retained; the document is reported as
    /// unrecoverable rather than guessed at.
    MarkMissing,
}

/// What the store confirmed, as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppliedOp {
    Upsert(StoreDocument),
    Update(StoreUpdate),
    Delete,
}

/// One confirmed operation and its inverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitLogEntry {
    pub token: SequenceToken,
    pub index: String,
    pub doc_id: String,
    pub applied: AppliedOp,
    pub compensation: Compensation,
    pub recorded_at: DateTime<Utc>,
}

/// Retention bounds for the commit log.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Maximum retained entries.
    pub max_entries: usize,
    /// Maximum entry age.
    pub max_age: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Last known store-side state for one document, tracked only while log
/// entries for it remain retained.
#[derive(Debug, Clone)]
enum KnownState {
    Present(StoreDocument),
    Absent,
    Unknown,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<CommitLogEntry>,
    /// (index, doc_id) -> latest known state + retained-entry count.
    state: HashMap<(String, String), (KnownState, usize)>,
    /// Highest token ever dropped by retention eviction.
    evicted_through: Option<SequenceToken>,
}

/// Tracks applied operations and serves rollback requests.
pub struct CommitLogTracker {
    retention: RetentionConfig,
    inner: Mutex<Inner>,
}

impl CommitLogTracker {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            retention,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record one confirmed operation, computing its compensation from the
    /// retained state, then evict past the retention bounds.
    pub async fn record(
        &self,
        token: SequenceToken,
        index: &str,
        doc_id: &str,
        applied: AppliedOp,
    ) -> CommitLogEntry {
        let mut inner = self.inner.lock().await;
        let entry = Self::build_entry(&mut inner, token, index, doc_id, applied);
        inner.entries.push_back(entry.clone());
        Self::evict(&mut inner, &self.retention);
        crate::metrics::set_commit_log_entries(inner.entries.len());
        entry
    }

    /// Restore the retained window from persisted entries (startup path).
    ///
    /// Entries must be in their original append order.
    pub async fn load(&self, entries: Vec<CommitLogEntry>) {
        let mut inner = self.inner.lock().await;
        for entry in entries {
            Self::track_state(&mut inner, &entry);
            inner.entries.push_back(entry);
        }
        Self::evict(&mut inner, &self.retention);
    }

    /// Entries with `token >= since`, most recent first.
    ///
    /// Errors when `since` predates the retained window: entries that would
    /// be needed have been evicted, so a partial undo would be silently
    /// incomplete.
    pub async fn undo_since(&self, since: SequenceToken) -> Result<Vec<CommitLogEntry>> {
        let inner = self.inner.lock().await;
        if let Some(evicted_through) = inner.evicted_through {
            if since <= evicted_through {
                crate::metrics::record_rollback_window_exceeded();
                return Err(DocManagerError::RollbackWindowExceeded {
                    requested: since,
                    oldest: evicted_through.next(),
                });
            }
        }
        Ok(inner
            .entries
            .iter()
            .rev()
            .filter(|e| e.token >= since)
            .cloned()
            .collect())
    }

    /// Drop entries with `token >= through` after their compensations were
    /// applied. Undone history is gone, not evicted: it does not shrink the
    /// rollback window.
    pub async fn prune_through(&self, through: SequenceToken) {
        let mut inner = self.inner.lock().await;
        let mut kept = VecDeque::with_capacity(inner.entries.len());
        let mut touched = Vec::new();
        for entry in inner.entries.drain(..) {
            if entry.token >= through {
                touched.push((entry.index, entry.doc_id));
            } else {
                kept.push_back(entry);
            }
        }
        inner.entries = kept;
        // State derived from undone entries no longer describes the store
        for key in touched {
            inner.state.remove(&key);
        }
        crate::metrics::set_commit_log_entries(inner.entries.len());
    }

    /// Number of retained entries.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Token of the oldest retained entry.
    pub async fn oldest_token(&self) -> Option<SequenceToken> {
        self.inner.lock().await.entries.front().map(|e| e.token)
    }

    /// Snapshot of the retained window, oldest first (persistence path).
    pub async fn snapshot(&self) -> Vec<CommitLogEntry> {
        self.inner.lock().await.entries.iter().cloned().collect()
    }

    fn build_entry(
        inner: &mut Inner,
        token: SequenceToken,
        index: &str,
        doc_id: &str,
        applied: AppliedOp,
    ) -> CommitLogEntry {
        let key = (index.to_string(), doc_id.to_string());
        let prior = inner
            .state
            .get(&key)
            .map(|(s, _)| s.clone())
            .unwrap_or(KnownState::Unknown);

        let compensation = match (&prior, &applied) {
            (KnownState::Present(doc), _) => Compensation::Restore(doc.clone()),
            (KnownState::Absent, _) => Compensation::Delete,
            // First sighting: an upsert is undone by deleting what it
            // created; anything else has no recoverable prior
            (KnownState::Unknown, AppliedOp::Upsert(_)) => Compensation::Delete,
            (KnownState::Unknown, _) => Compensation::MarkMissing,
        };

        let entry = CommitLogEntry {
            token,
            index: index.to_string(),
            doc_id: doc_id.to_string(),
            applied,
            compensation,
            recorded_at: Utc::now(),
        };
        Self::track_state(inner, &entry);
        entry
    }

    /// Advance the per-document known state past one entry.
    fn track_state(inner: &mut Inner, entry: &CommitLogEntry) {
        let key = (entry.index.clone(), entry.doc_id.clone());
        let slot = inner
            .state
            .entry(key)
            .or_insert((KnownState::Unknown, 0));
        slot.1 += 1;
        slot.0 = match (&slot.0, &entry.applied) {
            (_, AppliedOp::Upsert(doc)) => KnownState::Present(doc.clone()),
            (_, AppliedOp::Delete) => KnownState::Absent,
            (KnownState::Present(doc), AppliedOp::Update(update)) => {
                let mut fields = doc.fields.clone();
                update.apply_to(&mut fields);
                KnownState::Present(StoreDocument {
                    id: doc.id.clone(),
                    fields,
                    token: Some(entry.token),
                })
            }
            // An update on an absent or unknown document leaves the state
            // unknowable without a store read
            (_, AppliedOp::Update(_)) => KnownState::Unknown,
        };
    }

    fn evict(inner: &mut Inner, retention: &RetentionConfig) {
        let age_cutoff = Utc::now()
            - chrono::Duration::from_std(retention.max_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let mut evicted = 0usize;
        while let Some(front) = inner.entries.front() {
            let over_count = inner.entries.len() > retention.max_entries;
            let over_age = front.recorded_at < age_cutoff;
            if !over_count && !over_age {
                break;
            }
            let front = match inner.entries.pop_front() {
                Some(e) => e,
                None => break,
            };
            inner.evicted_through = Some(match inner.evicted_through {
                Some(t) => t.max(front.token),
                None => front.token,
            });
            let key = (front.index, front.doc_id);
            if let Some(slot) = inner.state.get_mut(&key) {
                slot.1 -= 1;
                if slot.1 == 0 {
                    inner.state.remove(&key);
                }
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, retained = inner.entries.len(), "Evicted commit-log entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, v: i64) -> StoreDocument {
        StoreDocument {
            id: id.to_string(),
            fields: json!({"v": v}).as_object().unwrap().clone(),
            token: None,
        }
    }

    fn tok(n: u64) -> SequenceToken {
        SequenceToken::from_raw(n)
    }

    fn tracker() -> CommitLogTracker {
        CommitLogTracker::new(RetentionConfig::default())
    }

    #[tokio::test]
    async fn test_first_upsert_compensates_with_delete() {
        let log = tracker();
        let entry = log
            .record(tok(1), "testdb", "1", AppliedOp::Upsert(doc("1", 1)))
            .await;
        assert_eq!(entry.compensation, Compensation::Delete);
    }

    #[tokio::test]
    async fn test_second_upsert_compensates_with_restore() {
        let log = tracker();
        log.record(tok(1), "testdb", "1", AppliedOp::Upsert(doc("1", 1)))
            .await;
        let entry = log
            .record(tok(2), "testdb", "1", AppliedOp::Upsert(doc("1", 2)))
            .await;
        assert_eq!(entry.compensation, Compensation::Restore(doc("1", 1)));
    }

    #[tokio::test]
    async fn test_delete_without_prior_marks_missing() {
        let log = tracker();
        let entry = log.record(tok(1), "testdb", "1", AppliedOp::Delete).await;
        assert_eq!(entry.compensation, Compensation::MarkMissing);
    }

    #[tokio::test]
    async fn test_upsert_after_delete_compensates_with_delete() {
        let log = tracker();
        log.record(tok(1), "testdb", "1", AppliedOp::Upsert(doc("1", 1)))
            .await;
        log.record(tok(2), "testdb", "1", AppliedOp::Delete).await;
        let entry = log
            .record(tok(3), "testdb", "1", AppliedOp::Upsert(doc("1", 3)))
            .await;
        // The document was known-absent before the upsert
        assert_eq!(entry.compensation, Compensation::Delete);
    }

    #[tokio::test]
    async fn test_update_tracks_state_through_prior_upsert() {
        let log = tracker();
        log.record(tok(1), "testdb", "1", AppliedOp::Upsert(doc("1", 1)))
            .await;
        let update = StoreUpdate {
            set: json!({"v": 2}).as_object().unwrap().clone(),
            unset: vec![],
        };
        log.record(tok(2), "testdb", "1", AppliedOp::Update(update))
            .await;
        // A third op restores the post-update state, not the original
        let entry = log.record(tok(3), "testdb", "1", AppliedOp::Delete).await;
        match entry.compensation {
            Compensation::Restore(d) => assert_eq!(d.fields["v"], json!(2)),
            other => panic!("expected restore, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_without_prior_marks_missing() {
        let log = tracker();
        let update = StoreUpdate {
            set: json!({"v": 1}).as_object().unwrap().clone(),
            unset: vec![],
        };
        let entry = log
            .record(tok(1), "testdb", "1", AppliedOp::Update(update))
            .await;
        assert_eq!(entry.compensation, Compensation::MarkMissing);
    }

    #[tokio::test]
    async fn test_undo_since_reverse_order() {
        let log = tracker();
        for i in 1..=5 {
            log.record(tok(i), "testdb", &i.to_string(), AppliedOp::Delete)
                .await;
        }
        let undo = log.undo_since(tok(3)).await.unwrap();
        let tokens: Vec<_> = undo.iter().map(|e| e.token.raw()).collect();
        assert_eq!(tokens, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_undo_since_window_exceeded() {
        let log = CommitLogTracker::new(RetentionConfig {
            max_entries: 3,
            max_age: Duration::from_secs(3600),
        });
        for i in 1..=10 {
            log.record(tok(i), "testdb", &i.to_string(), AppliedOp::Delete)
                .await;
        }
        assert_eq!(log.len().await, 3);

        // Tokens 1..=7 were evicted; asking for them must fail loudly
        let err = log.undo_since(tok(5)).await.unwrap_err();
        match err {
            DocManagerError::RollbackWindowExceeded { requested, oldest } => {
                assert_eq!(requested, tok(5));
                assert_eq!(oldest, tok(8));
            }
            other => panic!("expected window exceeded, got {other}"),
        }

        // Inside the window still works
        assert_eq!(log.undo_since(tok(8)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_age_based_eviction() {
        let log = CommitLogTracker::new(RetentionConfig {
            max_entries: 100,
            max_age: Duration::ZERO,
        });
        log.record(tok(1), "testdb", "1", AppliedOp::Delete).await;
        // Second record evicts the first (already past the zero max_age)
        log.record(tok(2), "testdb", "2", AppliedOp::Delete).await;
        assert!(log.oldest_token().await.map_or(true, |t| t > tok(1)));
    }

    #[tokio::test]
    async fn test_prune_through_keeps_window_intact() {
        let log = tracker();
        for i in 1..=5 {
            log.record(tok(i), "testdb", &i.to_string(), AppliedOp::Delete)
                .await;
        }
        log.prune_through(tok(4)).await;
        assert_eq!(log.len().await, 3);

        // Pruning undone entries does not close the window
        assert!(log.undo_since(tok(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_eviction_drops_state_with_last_entry() {
        let log = CommitLogTracker::new(RetentionConfig {
            max_entries: 1,
            max_age: Duration::from_secs(3600),
        });
        log.record(tok(1), "testdb", "1", AppliedOp::Upsert(doc("1", 1)))
            .await;
        // Evicts the entry for doc 1 and its tracked state
        log.record(tok(2), "testdb", "2", AppliedOp::Upsert(doc("2", 2)))
            .await;
        // Doc 1 is first-seen again
        let entry = log
            .record(tok(3), "testdb", "1", AppliedOp::Upsert(doc("1", 3)))
            .await;
        assert_eq!(entry.compensation, Compensation::Delete);
    }

    #[tokio::test]
    async fn test_snapshot_and_load_round_trip() {
        let log = tracker();
        log.record(tok(1), "testdb", "1", AppliedOp::Upsert(doc("1", 1)))
            .await;
        log.record(tok(2), "testdb", "1", AppliedOp::Delete).await;

        let snapshot = log.snapshot().await;
        assert_eq!(snapshot.len(), 2);

        let restored = tracker();
        restored.load(snapshot).await;
        assert_eq!(restored.len().await, 2);
        // State carried over: doc 1 is known-absent
        let entry = restored
            .record(tok(3), "testdb", "1", AppliedOp::Upsert(doc("1", 3)))
            .await;
        assert_eq!(entry.compensation, Compensation::Delete);
    }

    #[tokio::test]
    async fn test_entry_serde_round_trip() {
        let log = tracker();
        let entry = log
            .record(tok(7), "testdb", "1", AppliedOp::Upsert(doc("1", 7)))
            .await;
        let json = serde_json::to_string(&entry).unwrap();
        let back: CommitLogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
