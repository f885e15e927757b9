// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation buffer: ordered, coalescing accumulator for one namespace.
//!
//! Holds at most one pending operation per document id (latest wins) while
//! preserving arrival order for everything else. Coalescing happens at
//! enqueue time, so a document touched many times between flushes costs the
//! store exactly one bulk item.
//!
//! # Design
//!
//! ```text
//! enqueue ──▶ HashMap<id, slot>      (coalesce, latest wins)
//!             VecDeque<(id, seq)>    (arrival order; overwrite moves to back)
//!                    │
//!                    ▼
//!             drain(max_count, max_bytes) ──▶ frozen batch
//!             requeue_front(batch)         ◀── failed dispatch
//! ```
//!
//! The queue may hold stale pairs for ids that were overwritten or drained;
//! a pair is live only while its sequence number matches the slot's. Drain
//! skips the rest.

use crate::codec::UpdateSpec;
use crate::token::SequenceToken;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};

/// The effective operation pending for one document.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    /// Replace the whole document.
    Upsert(Map<String, Value>),
    /// Apply a field-level diff without reading the store.
    PartialUpdate(UpdateSpec),
    /// Remove the document.
    Delete,
}

impl OperationKind {
    /// Rough serialized size, for the byte-bounded drain.
    fn estimated_bytes(&self) -> usize {
        match self {
            Self::Upsert(doc) => serde_json::to_vec(doc).map(|v| v.len()).unwrap_or(64),
            Self::PartialUpdate(spec) => {
                serde_json::to_vec(spec).map(|v| v.len()).unwrap_or(64)
            }
            Self::Delete => 32,
        }
    }
}

/// One coalesced pending operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedOperation {
    /// Canonical document id.
    pub id: String,
    /// Effective operation after coalescing.
    pub kind: OperationKind,
    /// Token of the most recent intent folded into this entry.
    pub token: SequenceToken,
}

#[derive(Debug)]
struct Slot {
    op: BufferedOperation,
    /// Live queue pair for this id carries the same sequence number.
    seq: i64,
    bytes: usize,
}

/// Ordered coalescing buffer for one namespace's pending operations.
pub struct OperationBuffer {
    slots: HashMap<String, Slot>,
    queue: VecDeque<(String, i64)>,
    /// Increasing sequence for normal enqueues.
    next_back: i64,
    /// Decreasing sequence for requeued batches (sorts before everything).
    next_front: i64,
    total_bytes: usize,
}

impl Default for OperationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationBuffer {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            queue: VecDeque::new(),
            next_back: 1,
            next_front: -1,
            total_bytes: 0,
        }
    }

    /// Number of distinct pending documents.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Estimated serialized size of everything pending.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Add an operation, coalescing with any pending entry for the same id.
    ///
    /// A coalesced entry moves to the most-recent position; a first
    /// insertion takes the next FIFO slot.
    pub fn enqueue(&mut self, op: BufferedOperation) {
        let seq = self.next_back;
        self.next_back += 1;

        let op = match self.slots.remove(&op.id) {
            Some(prior) => {
                self.total_bytes -= prior.bytes;
                coalesce(prior.op, op)
            }
            None => op,
        };

        let bytes = op.kind.estimated_bytes();
        self.total_bytes += bytes;
        self.queue.push_back((op.id.clone(), seq));
        self.slots.insert(op.id.clone(), Slot { op, seq, bytes });
    }

    /// Remove and return up to `max_count` operations (or fewer once the
    /// byte bound is hit) in arrival order. Always returns at least one
    /// entry when the buffer is non-empty.
    pub fn drain(&mut self, max_count: usize, max_bytes: usize) -> Vec<BufferedOperation> {
        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;

        while batch.len() < max_count {
            let (id, seq) = match self.queue.front() {
                Some(pair) => pair.clone(),
                None => break,
            };
            let live = self.slots.get(&id).map_or(false, |slot| slot.seq == seq);
            if !live {
                // Stale pair: overwritten or already drained
                self.queue.pop_front();
                continue;
            }
            let slot_bytes = self.slots[&id].bytes;
            if !batch.is_empty() && batch_bytes + slot_bytes > max_bytes {
                break;
            }
            self.queue.pop_front();
            let slot = self
                .slots
                .remove(&id)
                .unwrap_or_else(|| unreachable!("liveness checked above"));
            self.total_bytes -= slot.bytes;
            batch_bytes += slot.bytes;
            batch.push(slot.op);
        }

        batch
    }

    /// Return a failed batch to the head of the buffer, preserving its
    /// internal order.
    ///
    /// If a fresh operation arrived for one of the ids since the drain, the
    /// two coalesce (the requeued op as the earlier one) and the fresh
    /// entry's position wins.
    pub fn requeue_front(&mut self, ops: Vec<BufferedOperation>) {
        for op in ops.into_iter().rev() {
            match self.slots.remove(&op.id) {
                Some(fresh) => {
                    self.total_bytes -= fresh.bytes;
                    let merged = coalesce(op, fresh.op);
                    let bytes = merged.kind.estimated_bytes();
                    self.total_bytes += bytes;
                    self.slots.insert(
                        merged.id.clone(),
                        Slot {
                            op: merged,
                            seq: fresh.seq,
                            bytes,
                        },
                    );
                }
                None => {
                    let seq = self.next_front;
                    self.next_front -= 1;
                    let bytes = op.kind.estimated_bytes();
                    self.total_bytes += bytes;
                    self.queue.push_front((op.id.clone(), seq));
                    self.slots.insert(op.id.clone(), Slot { op, seq, bytes });
                }
            }
        }
    }
}

/// Fold a later operation into an earlier pending one for the same id.
fn coalesce(earlier: BufferedOperation, later: BufferedOperation) -> BufferedOperation {
    let token = earlier.token.max(later.token);
    let kind = match (earlier.kind, later.kind) {
        // A later delete or full upsert supersedes anything
        (_, OperationKind::Delete) => OperationKind::Delete,
        (_, k @ OperationKind::Upsert(_)) => k,
        // A diff on a buffered full document applies locally
        (OperationKind::Upsert(mut doc), OperationKind::PartialUpdate(spec)) => {
            spec.apply_to(&mut doc);
            OperationKind::Upsert(doc)
        }
        (OperationKind::PartialUpdate(mut first), OperationKind::PartialUpdate(second)) => {
            first.merge(&second);
            OperationKind::PartialUpdate(first)
        }
        // The store-side update creates-or-updates by id
        (OperationKind::Delete, k @ OperationKind::PartialUpdate(_)) => k,
    };
    BufferedOperation {
        id: later.id,
        kind,
        token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(id: &str, token: u64, body: Value) -> BufferedOperation {
        BufferedOperation {
            id: id.to_string(),
            kind: OperationKind::Upsert(body.as_object().unwrap().clone()),
            token: SequenceToken::from_raw(token),
        }
    }

    fn update(id: &str, token: u64, set: Value, unset: &[&str]) -> BufferedOperation {
        BufferedOperation {
            id: id.to_string(),
            kind: OperationKind::PartialUpdate(UpdateSpec {
                set: set.as_object().unwrap().clone(),
                unset: unset.iter().map(|s| s.to_string()).collect(),
            }),
            token: SequenceToken::from_raw(token),
        }
    }

    fn delete(id: &str, token: u64) -> BufferedOperation {
        BufferedOperation {
            id: id.to_string(),
            kind: OperationKind::Delete,
            token: SequenceToken::from_raw(token),
        }
    }

    fn drain_all(buf: &mut OperationBuffer) -> Vec<BufferedOperation> {
        buf.drain(usize::MAX, usize::MAX)
    }

    #[test]
    fn test_upsert_upsert_latest_wins() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(upsert("1", 1, json!({"v": 1})));
        buf.enqueue(upsert("1", 2, json!({"v": 2})));

        assert_eq!(buf.len(), 1);
        let batch = drain_all(&mut buf);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, OperationKind::Upsert(json!({"v": 2}).as_object().unwrap().clone()));
        assert_eq!(batch[0].token, SequenceToken::from_raw(2));
    }

    #[test]
    fn test_upsert_then_delete_coalesces_to_delete() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(upsert("1", 1, json!({"v": 1})));
        buf.enqueue(delete("1", 2));

        let batch = drain_all(&mut buf);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, OperationKind::Delete);
    }

    #[test]
    fn test_delete_then_upsert_coalesces_to_upsert() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(delete("1", 1));
        buf.enqueue(upsert("1", 2, json!({"v": 2})));

        let batch = drain_all(&mut buf);
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0].kind, OperationKind::Upsert(_)));
    }

    #[test]
    fn test_update_applies_to_buffered_upsert() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(upsert("1", 1, json!({"a": 1, "b": 2})));
        buf.enqueue(update("1", 2, json!({"a": 10}), &["b"]));

        let batch = drain_all(&mut buf);
        assert_eq!(batch.len(), 1);
        match &batch[0].kind {
            OperationKind::Upsert(doc) => {
                assert_eq!(Value::Object(doc.clone()), json!({"a": 10}));
            }
            other => panic!("expected upsert, got {other:?}"),
        }
        assert_eq!(batch[0].token, SequenceToken::from_raw(2));
    }

    #[test]
    fn test_update_update_merges() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(update("1", 1, json!({"a": 1, "b": 2}), &[]));
        buf.enqueue(update("1", 2, json!({"b": 20}), &["a"]));

        let batch = drain_all(&mut buf);
        match &batch[0].kind {
            OperationKind::PartialUpdate(spec) => {
                assert_eq!(Value::Object(spec.set.clone()), json!({"b": 20}));
                assert_eq!(spec.unset, vec!["a".to_string()]);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_then_update_becomes_update() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(delete("1", 1));
        buf.enqueue(update("1", 2, json!({"a": 1}), &[]));

        let batch = drain_all(&mut buf);
        assert!(matches!(batch[0].kind, OperationKind::PartialUpdate(_)));
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(upsert("a", 1, json!({})));
        buf.enqueue(upsert("b", 2, json!({})));
        buf.enqueue(upsert("c", 3, json!({})));

        let ids: Vec<_> = drain_all(&mut buf).into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_overwrite_moves_to_back() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(upsert("a", 1, json!({})));
        buf.enqueue(upsert("b", 2, json!({})));
        buf.enqueue(upsert("a", 3, json!({"v": 2})));

        let ids: Vec<_> = drain_all(&mut buf).into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_drain_respects_max_count() {
        let mut buf = OperationBuffer::new();
        for i in 0..10 {
            buf.enqueue(upsert(&format!("id{i}"), i, json!({})));
        }

        let batch = buf.drain(4, usize::MAX);
        assert_eq!(batch.len(), 4);
        assert_eq!(buf.len(), 6);
        let rest = drain_all(&mut buf);
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0].id, "id4");
    }

    #[test]
    fn test_drain_respects_max_bytes_but_returns_at_least_one() {
        let mut buf = OperationBuffer::new();
        let big = json!({"payload": "x".repeat(500)});
        buf.enqueue(upsert("a", 1, big.clone()));
        buf.enqueue(upsert("b", 2, big));

        // Bound smaller than one entry still yields the first entry
        let batch = buf.drain(10, 16);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "a");
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_enqueue_after_drain_is_fresh() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(upsert("a", 1, json!({"v": 1})));
        let drained = drain_all(&mut buf);
        assert_eq!(drained.len(), 1);
        assert!(buf.is_empty());

        buf.enqueue(upsert("a", 2, json!({"v": 2})));
        assert_eq!(buf.len(), 1);
        let batch = drain_all(&mut buf);
        assert_eq!(batch[0].token, SequenceToken::from_raw(2));
    }

    #[test]
    fn test_requeue_front_preserves_order_ahead_of_pending() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(upsert("a", 1, json!({})));
        buf.enqueue(upsert("b", 2, json!({})));
        let failed = buf.drain(2, usize::MAX);

        buf.enqueue(upsert("c", 3, json!({})));
        buf.requeue_front(failed);

        let ids: Vec<_> = drain_all(&mut buf).into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_requeue_coalesces_with_fresh_entry() {
        let mut buf = OperationBuffer::new();
        buf.enqueue(upsert("a", 1, json!({"v": 1, "keep": true})));
        let failed = buf.drain(1, usize::MAX);

        // A fresh diff arrived while the batch was in flight
        buf.enqueue(update("a", 2, json!({"v": 2}), &[]));
        buf.requeue_front(failed);

        assert_eq!(buf.len(), 1);
        let batch = drain_all(&mut buf);
        match &batch[0].kind {
            OperationKind::Upsert(doc) => {
                assert_eq!(Value::Object(doc.clone()), json!({"v": 2, "keep": true}));
            }
            other => panic!("expected upsert, got {other:?}"),
        }
        assert_eq!(batch[0].token, SequenceToken::from_raw(2));
    }

    #[test]
    fn test_byte_accounting_tracks_enqueue_and_drain() {
        let mut buf = OperationBuffer::new();
        assert_eq!(buf.total_bytes(), 0);

        buf.enqueue(upsert("a", 1, json!({"v": 1})));
        let after_one = buf.total_bytes();
        assert!(after_one > 0);

        buf.enqueue(delete("a", 2));
        assert_ne!(buf.total_bytes(), after_one);

        drain_all(&mut buf);
        assert_eq!(buf.total_bytes(), 0);
    }
}
