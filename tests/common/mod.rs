//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory MockDocumentStore that records calls and applies writes
//! - Intent and field-map helpers

pub mod mock_store;

pub use mock_store::*;

use doc_manager::SequenceToken;
use serde_json::{Map, Value};

/// Build a field map from literal pairs.
pub fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Shorthand token from a raw value.
pub fn tok(n: u64) -> SequenceToken {
    SequenceToken::from_raw(n)
}
