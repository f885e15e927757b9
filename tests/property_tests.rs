//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use doc_manager::buffer::{BufferedOperation, OperationBuffer, OperationKind};
use doc_manager::codec::{DocumentCodec, StoreDocument, UpdateSpec};
use doc_manager::token::SequenceToken;
use proptest::prelude::*;
use serde_json::{json, Map, Value};

// =============================================================================
// Sequence Token Properties
// =============================================================================

proptest! {
    /// Packing seconds and ordinal and unpacking them is lossless
    #[test]
    fn token_parts_round_trip(secs in any::<u32>(), ordinal in any::<u32>()) {
        let token = SequenceToken::from_parts(secs, ordinal);
        prop_assert_eq!(token.seconds(), secs);
        prop_assert_eq!(token.ordinal(), ordinal);
    }

    /// Raw encoding round trips
    #[test]
    fn token_raw_round_trip(raw in any::<u64>()) {
        prop_assert_eq!(SequenceToken::from_raw(raw).raw(), raw);
    }

    /// Token order is (seconds, ordinal) lexicographic
    #[test]
    fn token_order_matches_parts(
        s1 in any::<u32>(), o1 in any::<u32>(),
        s2 in any::<u32>(), o2 in any::<u32>(),
    ) {
        let t1 = SequenceToken::from_parts(s1, o1);
        let t2 = SequenceToken::from_parts(s2, o2);
        prop_assert_eq!(t1.cmp(&t2), (s1, o1).cmp(&(s2, o2)));
    }

    /// Display and parse are inverses
    #[test]
    fn token_display_parse_round_trip(secs in any::<u32>(), ordinal in any::<u32>()) {
        let token = SequenceToken::from_parts(secs, ordinal);
        let parsed: SequenceToken = token.to_string().parse().unwrap();
        prop_assert_eq!(parsed, token);
    }

    /// next() is strictly increasing
    #[test]
    fn token_next_strictly_greater(raw in 0u64..u64::MAX) {
        let token = SequenceToken::from_raw(raw);
        prop_assert!(token.next() > token);
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

/// Field names likely to hit every escape branch: plain, reserved, and
/// tilde-prefixed.
fn field_key() -> impl Strategy<Value = String> + Clone {
    prop_oneof![
        "[a-z]{1,8}",
        Just("_id".to_string()),
        Just("_source".to_string()),
        Just("_type".to_string()),
        Just("~x".to_string()),
        Just("~~y".to_string()),
        Just("~_id".to_string()),
    ]
}

fn scalar_value() -> impl Strategy<Value = Value> + Clone {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        Just(Value::Null),
    ]
}

/// Documents up to two levels deep with adversarial keys.
fn document() -> impl Strategy<Value = Map<String, Value>> {
    let leaf = prop::collection::btree_map(field_key(), scalar_value(), 0..4)
        .prop_map(|m| m.into_iter().collect::<Map<String, Value>>());
    prop::collection::btree_map(
        field_key(),
        prop_oneof![
            scalar_value(),
            leaf.clone().prop_map(Value::Object),
            prop::collection::vec(scalar_value(), 0..3).prop_map(Value::Array),
        ],
        0..5,
    )
    .prop_map(|m| m.into_iter().collect())
}

proptest! {
    /// decode() inverts encode() for any document
    #[test]
    fn codec_encode_decode_round_trip(doc in document()) {
        let codec = DocumentCodec::default();
        let encoded = codec.encode(&json!("id"), &doc).unwrap();
        let (_, decoded) = codec.decode(&encoded);
        prop_assert_eq!(decoded, doc);
    }

    /// Escaping never loses or merges fields
    #[test]
    fn codec_escape_preserves_field_count(doc in document()) {
        let codec = DocumentCodec::default();
        let encoded = codec.encode(&json!("id"), &doc).unwrap();
        prop_assert_eq!(encoded.fields.len(), doc.len());
    }

    /// No reserved key survives encoding at the top level
    #[test]
    fn codec_encoded_keys_never_reserved(doc in document()) {
        let codec = DocumentCodec::default();
        let encoded = codec.encode(&json!("id"), &doc).unwrap();
        for key in encoded.fields.keys() {
            prop_assert!(!["_id", "_index", "_type", "_source", "_score", "_routing", "_version"]
                .contains(&key.as_str()));
        }
    }

    /// canonical_id is deterministic and stable under re-parse
    #[test]
    fn canonical_id_deterministic(n in any::<i64>(), s in "[a-z0-9-]{1,16}") {
        let composite = json!({"n": n, "s": s});
        let first = DocumentCodec::canonical_id(&composite).unwrap();
        let second = DocumentCodec::canonical_id(&composite).unwrap();
        prop_assert_eq!(&first, &second);
        // The rendering itself is valid JSON describing the same value
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        prop_assert_eq!(reparsed, composite);
    }

    /// Token survives a serde round trip through the document wire form
    #[test]
    fn store_document_serde_round_trip(doc in document(), raw in any::<u64>()) {
        let store_doc = StoreDocument {
            id: "doc".to_string(),
            fields: doc,
            token: Some(SequenceToken::from_raw(raw)),
        };
        let bytes = serde_json::to_string(&store_doc).unwrap();
        let back: StoreDocument = serde_json::from_str(&bytes).unwrap();
        prop_assert_eq!(back, store_doc);
    }
}

// =============================================================================
// Update Spec Properties
// =============================================================================

/// Flat (undotted) keys; path interactions across nesting levels are
/// covered by unit tests.
fn flat_spec() -> impl Strategy<Value = UpdateSpec> {
    (
        prop::collection::btree_map("[a-j]", scalar_value(), 0..5),
        prop::collection::vec("[a-j]", 0..5),
    )
        .prop_map(|(set, unset)| UpdateSpec {
            set: set.into_iter().collect(),
            unset,
        })
}

proptest! {
    /// Merging two flat diffs then applying equals applying them in order
    #[test]
    fn update_merge_equals_sequential_apply(
        base in prop::collection::btree_map("[a-j]", scalar_value(), 0..5),
        first in flat_spec(),
        later in flat_spec(),
    ) {
        let base: Map<String, Value> = base.into_iter().collect();

        let mut sequential = base.clone();
        first.apply_to(&mut sequential);
        later.apply_to(&mut sequential);

        let mut merged_spec = first.clone();
        merged_spec.merge(&later);
        let mut merged = base;
        merged_spec.apply_to(&mut merged);

        prop_assert_eq!(merged, sequential);
    }

    /// A path both set and unset in one diff ends up absent
    #[test]
    fn update_unset_wins_within_one_diff(key in "[a-j]", value in scalar_value()) {
        let mut doc = Map::new();
        let mut spec = UpdateSpec::default();
        spec.set.insert(key.clone(), value);
        spec.unset.push(key.clone());
        spec.apply_to(&mut doc);
        prop_assert!(!doc.contains_key(&key));
    }
}

// =============================================================================
// Coalescing Buffer Properties
// =============================================================================

fn upsert(id: &str, token: u64, v: u64) -> BufferedOperation {
    BufferedOperation {
        id: id.to_string(),
        kind: OperationKind::Upsert(json!({"v": v}).as_object().unwrap().clone()),
        token: SequenceToken::from_raw(token),
    }
}

proptest! {
    /// Any number of upserts to one id leave exactly one slot holding the
    /// last value and the highest token
    #[test]
    fn buffer_coalesces_same_id_last_wins(values in prop::collection::vec(any::<u64>(), 1..30)) {
        let mut buffer = OperationBuffer::new();
        for (i, v) in values.iter().enumerate() {
            buffer.enqueue(upsert("doc", i as u64 + 1, *v));
        }

        prop_assert_eq!(buffer.len(), 1);
        let drained = buffer.drain(usize::MAX, usize::MAX);
        prop_assert_eq!(drained.len(), 1);
        prop_assert_eq!(drained[0].token, SequenceToken::from_raw(values.len() as u64));
        match &drained[0].kind {
            OperationKind::Upsert(fields) => {
                prop_assert_eq!(&fields["v"], &json!(values[values.len() - 1]));
            }
            other => prop_assert!(false, "expected upsert, got {:?}", other),
        }
    }

    /// Distinct ids never coalesce and drain in arrival order
    #[test]
    fn buffer_distinct_ids_drain_in_order(count in 1usize..40) {
        let mut buffer = OperationBuffer::new();
        for i in 0..count {
            buffer.enqueue(upsert(&format!("id-{i}"), i as u64 + 1, 0));
        }

        prop_assert_eq!(buffer.len(), count);
        let drained = buffer.drain(usize::MAX, usize::MAX);
        let ids: Vec<String> = drained.iter().map(|op| op.id.clone()).collect();
        let expected: Vec<String> = (0..count).map(|i| format!("id-{i}")).collect();
        prop_assert_eq!(ids, expected);
    }

    /// A delete always supersedes whatever was buffered for the id
    #[test]
    fn buffer_delete_supersedes(values in prop::collection::vec(any::<u64>(), 0..10)) {
        let mut buffer = OperationBuffer::new();
        for (i, v) in values.iter().enumerate() {
            buffer.enqueue(upsert("doc", i as u64 + 1, *v));
        }
        buffer.enqueue(BufferedOperation {
            id: "doc".to_string(),
            kind: OperationKind::Delete,
            token: SequenceToken::from_raw(values.len() as u64 + 1),
        });

        let drained = buffer.drain(usize::MAX, usize::MAX);
        prop_assert_eq!(drained.len(), 1);
        prop_assert!(matches!(drained[0].kind, OperationKind::Delete));
    }

    /// Draining respects the item bound and keeps the remainder
    #[test]
    fn buffer_drain_respects_item_bound(count in 1usize..40, bound in 1usize..40) {
        let mut buffer = OperationBuffer::new();
        for i in 0..count {
            buffer.enqueue(upsert(&format!("id-{i}"), i as u64 + 1, 0));
        }

        let drained = buffer.drain(bound, usize::MAX);
        prop_assert_eq!(drained.len(), bound.min(count));
        prop_assert_eq!(buffer.len(), count - bound.min(count));
    }
}
