//! Mock DocumentStore for testing.
//!
//! Applies bulk writes to an in-memory document map so tests can assert
//! on final store contents, records every call for assertions, and
//! supports scripted failures:
//! - whole-call failures (connection-level) for the next N calls
//! - per-document `ItemStatus` scripts, consumed front-first

use doc_manager::codec::StoreDocument;
use doc_manager::store::{BoxFuture, DocumentStore, ItemStatus, StoreAction, StoreError, StoreOp};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A recorded bulk_write() call.
#[derive(Debug, Clone)]
pub struct BulkCall {
    pub index: String,
    pub actions: Vec<StoreAction>,
}

/// A recorded sweep_delete() call.
#[derive(Debug, Clone)]
pub struct SweepCall {
    pub index: String,
    pub epoch_field: String,
    pub keep_epoch: String,
}

/// Mock implementation of DocumentStore backed by an in-memory map.
///
/// # Example
/// ```rust,ignore
/// let store = MockDocumentStore::new();
///
/// // Configure failures
/// store.fail_whole_calls(2);
/// store.script_item("poisoned", ItemStatus::Fatal("mapping conflict".into()));
///
/// // Use in tests...
///
/// // Assert what happened
/// assert_eq!(store.bulk_call_count(), 3);
/// assert!(store.document("testdb", "1").is_some());
/// ```
pub struct MockDocumentStore {
    /// (index, doc_id) -> current document
    documents: Mutex<HashMap<(String, String), StoreDocument>>,
    /// Recorded bulk_write() calls
    bulk_calls: Mutex<Vec<BulkCall>>,
    /// Recorded sweep_delete() calls
    sweep_calls: Mutex<Vec<SweepCall>>,
    /// Whole calls left to fail before recovering
    fail_whole: AtomicUsize,
    /// Per-document status scripts, consumed front-first
    item_scripts: Mutex<HashMap<String, VecDeque<ItemStatus>>>,
    /// Time each bulk call spends "on the wire" before settling
    latency: Mutex<Option<std::time::Duration>>,
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            bulk_calls: Mutex::new(Vec::new()),
            sweep_calls: Mutex::new(Vec::new()),
            fail_whole: AtomicUsize::new(0),
            item_scripts: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
        }
    }

    // =========================================================================
    // Failure Configuration
    // =========================================================================

    /// Fail the next `n` whole bulk calls with a connection error.
    pub fn fail_whole_calls(&self, n: usize) {
        self.fail_whole.store(n, Ordering::SeqCst);
    }

    /// Delay every bulk call by `latency` before it settles or fails.
    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Script the next status for one document id (repeatable).
    pub fn script_item(&self, id: &str, status: ItemStatus) {
        self.item_scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(status);
    }

    // =========================================================================
    // Seeding and Queries
    // =========================================================================

    /// Seed a document directly (bypasses the bulk path).
    pub fn seed(&self, index: &str, doc: StoreDocument) {
        self.documents
            .lock()
            .unwrap()
            .insert((index.to_string(), doc.id.clone()), doc);
    }

    /// Current version of one document, if present.
    pub fn document(&self, index: &str, id: &str) -> Option<StoreDocument> {
        self.documents
            .lock()
            .unwrap()
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of documents currently in one index.
    pub fn doc_count(&self, index: &str) -> usize {
        self.documents
            .lock()
            .unwrap()
            .keys()
            .filter(|(i, _)| i == index)
            .count()
    }

    /// All recorded bulk calls.
    pub fn bulk_calls(&self) -> Vec<BulkCall> {
        self.bulk_calls.lock().unwrap().clone()
    }

    /// Count of bulk calls that reached the store (including failed ones).
    pub fn bulk_call_count(&self) -> usize {
        self.bulk_calls.lock().unwrap().len()
    }

    /// All recorded sweep calls.
    pub fn sweep_calls(&self) -> Vec<SweepCall> {
        self.sweep_calls.lock().unwrap().clone()
    }

    fn apply(&self, index: &str, action: &StoreAction) {
        let key = (index.to_string(), action.id.clone());
        let mut documents = self.documents.lock().unwrap();
        match &action.op {
            StoreOp::Index(doc) => {
                documents.insert(key, doc.clone());
            }
            StoreOp::Update(update) => {
                let doc = documents.entry(key).or_insert_with(|| StoreDocument {
                    id: action.id.clone(),
                    fields: serde_json::Map::new(),
                    token: None,
                });
                update.apply_to(&mut doc.fields);
            }
            StoreOp::Delete => {
                documents.remove(&key);
            }
        }
    }
}

impl Default for MockDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MockDocumentStore {
    fn bulk_write(
        &self,
        index: &str,
        actions: Vec<StoreAction>,
    ) -> BoxFuture<'_, Vec<ItemStatus>> {
        let index = index.to_string();
        self.bulk_calls.lock().unwrap().push(BulkCall {
            index: index.clone(),
            actions: actions.clone(),
        });

        let fail = self
            .fail_whole
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let latency = *self.latency.lock().unwrap();

        Box::pin(async move {
            // Nothing lands while the call is "on the wire"
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if fail {
                return Err(StoreError("connection refused".to_string()));
            }

            let mut statuses = Vec::with_capacity(actions.len());
            {
                let mut scripts = self.item_scripts.lock().unwrap();
                for action in &actions {
                    let status = scripts
                        .get_mut(&action.id)
                        .and_then(|q| q.pop_front())
                        .unwrap_or(ItemStatus::Ok);
                    if status.is_ok() {
                        self.apply(&index, action);
                    }
                    statuses.push(status);
                }
            }
            Ok(statuses)
        })
    }

    fn sweep_delete(
        &self,
        index: &str,
        epoch_field: &str,
        keep_epoch: &str,
    ) -> BoxFuture<'_, u64> {
        self.sweep_calls.lock().unwrap().push(SweepCall {
            index: index.to_string(),
            epoch_field: epoch_field.to_string(),
            keep_epoch: keep_epoch.to_string(),
        });

        let keep = serde_json::Value::String(keep_epoch.to_string());
        let mut documents = self.documents.lock().unwrap();
        let stale: Vec<_> = documents
            .iter()
            .filter(|((i, _), doc)| i == index && doc.fields.get(epoch_field) != Some(&keep))
            .map(|(key, _)| key.clone())
            .collect();
        let swept = stale.len() as u64;
        for key in stale {
            documents.remove(&key);
        }
        Box::pin(async move { Ok(swept) })
    }

    fn get(&self, index: &str, id: &str) -> BoxFuture<'_, Option<StoreDocument>> {
        let doc = self.document(index, id);
        Box::pin(async move { Ok(doc) })
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

    #[tokio::test]
    async fn test_mock_applies_index_and_delete() {
        let store = MockDocumentStore::new();
        store
            .bulk_write(
                "testdb",
                vec![StoreAction {
                    id: "1".to_string(),
                    op: StoreOp::Index(doc("1", 1)),
                }],
            )
            .await
            .unwrap();
        assert!(store.document("testdb", "1").is_some());

        store
            .bulk_write(
                "testdb",
                vec![StoreAction {
                    id: "1".to_string(),
                    op: StoreOp::Delete,
                }],
            )
            .await
            .unwrap();
        assert!(store.document("testdb", "1").is_none());
    }

    #[tokio::test]
    async fn test_mock_fail_whole_calls() {
        let store = MockDocumentStore::new();
        store.fail_whole_calls(1);

        let first = store
            .bulk_write(
                "testdb",
                vec![StoreAction {
                    id: "1".to_string(),
                    op: StoreOp::Delete,
                }],
            )
            .await;
        assert!(first.is_err());

        let second = store.bulk_write("testdb", vec![]).await;
        assert!(second.is_ok());
        assert_eq!(store.bulk_call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_item_script_consumed_front_first() {
        let store = MockDocumentStore::new();
        store.script_item("1", ItemStatus::Retryable("busy".to_string()));

        let action = StoreAction {
            id: "1".to_string(),
            op: StoreOp::Index(doc("1", 1)),
        };

        let statuses = store
            .bulk_write("testdb", vec![action.clone()])
            .await
            .unwrap();
        assert!(matches!(statuses[0], ItemStatus::Retryable(_)));
        // A scripted failure does not apply the write
        assert!(store.document("testdb", "1").is_none());

        let statuses = store.bulk_write("testdb", vec![action]).await.unwrap();
        assert!(statuses[0].is_ok());
        assert!(store.document("testdb", "1").is_some());
    }

    #[tokio::test]
    async fn test_mock_latency_holds_write_until_settled() {
        let store = MockDocumentStore::new();
        store.set_latency(std::time::Duration::from_millis(50));

        let call = store.bulk_write(
            "testdb",
            vec![StoreAction {
                id: "1".to_string(),
                op: StoreOp::Index(doc("1", 1)),
            }],
        );
        let started = std::time::Instant::now();
        call.await.unwrap();

        assert!(started.elapsed() >= std::time::Duration::from_millis(40));
        assert!(store.document("testdb", "1").is_some());
    }

    #[tokio::test]
    async fn test_mock_sweep_removes_stale_epochs() {
        let store = MockDocumentStore::new();
        let mut fresh = doc("fresh", 1);
        fresh
            .fields
            .insert("sync_epoch".to_string(), json!("100"));
        store.seed("testdb", fresh);
        store.seed("testdb", doc("stale", 2));

        let swept = store
            .sweep_delete("testdb", "sync_epoch", "100")
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert!(store.document("testdb", "fresh").is_some());
        assert!(store.document("testdb", "stale").is_none());
    }
}
