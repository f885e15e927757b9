// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document codec: upstream documents to/from the store's wire form.
//!
//! The codec is pure and deterministic. It owns three concerns:
//!
//! - **Ids**: any upstream id value becomes a stable string
//!   ([`DocumentCodec::canonical_id`]). The same id always produces the
//!   same string, so coalescing and store-side versioning line up.
//! - **Key escaping**: field names the store reserves (`_id`, `_source`,
//!   ...) are escaped reversibly with a leading `~`. The scheme is
//!   injective: keys that already start with `~` gain another one, and
//!   decode strips exactly one.
//! - **Update specs**: a [`UpdateSpec`] is a field-level diff (set/unset
//!   with dotted paths). It can be applied locally to a buffered document
//!   or encoded as a partial-update instruction for the store, so updates
//!   never require reading the store from the ingest path.

use crate::error::{DocManagerError, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::token::SequenceToken;

/// Field names the store reserves for its own metadata.
const RESERVED_KEYS: &[&str] = &[
    "_id", "_index", "_type", "_source", "_score", "_routing", "_version",
];

/// A document in the store's wire form: stable string id plus a field map
/// with store-safe keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    pub id: String,
    pub fields: Map<String, Value>,
    /// Sequence marker for optimistic concurrency, when the caller has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<SequenceToken>,
}

/// A field-level diff: fields to set and paths to remove.
///
/// Paths may be dotted (`"a.b.c"`); intermediate objects are created on
/// set and ignored if absent on unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub unset: Vec<String>,
}

impl UpdateSpec {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply this diff to a document in place. Unsets run after sets, so a
    /// path both set and unset ends up absent.
    pub fn apply_to(&self, fields: &mut Map<String, Value>) {
        for (path, value) in &self.set {
            set_path(fields, path, value.clone());
        }
        for path in &self.unset {
            unset_path(fields, path);
        }
    }

    /// Merge a later diff into this one. Later sets win; a later set of a
    /// previously unset path revives it, and a later unset of a previously
    /// set path drops it.
    pub fn merge(&mut self, later: &UpdateSpec) {
        for (path, value) in &later.set {
            self.unset.retain(|p| p != path);
            self.set.insert(path.clone(), value.clone());
        }
        for path in &later.unset {
            self.set.remove(path);
            if !self.unset.contains(path) {
                self.unset.push(path.clone());
            }
        }
    }
}

/// A partial-update instruction in the store's wire form (escaped keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub set: Map<String, Value>,
    pub unset: Vec<String>,
}

impl StoreUpdate {
    /// Apply this instruction to an already-encoded field map. Both sides
    /// use escaped keys, so paths line up.
    pub fn apply_to(&self, fields: &mut Map<String, Value>) {
        for (path, value) in &self.set {
            set_path(fields, path, value.clone());
        }
        for path in &self.unset {
            unset_path(fields, path);
        }
    }
}

/// How to handle binary file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryPolicy {
    /// Store content base64-encoded under a `content` field.
    Base64,
    /// Index metadata only; drop the content.
    Omit,
}

impl Default for BinaryPolicy {
    fn default() -> Self {
        Self::Base64
    }
}

/// Encodes upstream documents into store documents and back.
#[derive(Debug, Clone, Default)]
pub struct DocumentCodec {
    binary_policy: BinaryPolicy,
}

impl DocumentCodec {
    pub fn new(binary_policy: BinaryPolicy) -> Self {
        Self { binary_policy }
    }

    /// Render an upstream id value as a stable string.
    ///
    /// Strings pass through; everything else serializes to canonical JSON
    /// (serde_json orders object keys, so composite ids are stable).
    pub fn canonical_id(id: &Value) -> Result<String> {
        match id {
            Value::String(s) => Ok(s.clone()),
            Value::Null => Err(DocManagerError::Internal(
                "document id must not be null".to_string(),
            )),
            other => serde_json::to_string(other)
                .map_err(|e| DocManagerError::Internal(format!("unserializable id: {e}"))),
        }
    }

    /// Encode an upstream document for the store.
    pub fn encode(&self, id: &Value, document: &Map<String, Value>) -> Result<StoreDocument> {
        Ok(StoreDocument {
            id: Self::canonical_id(id)?,
            fields: escape_map(document),
            token: None,
        })
    }

    /// Invert [`encode`](Self::encode): recover the upstream field names.
    /// The id stays in its string form.
    pub fn decode(&self, doc: &StoreDocument) -> (String, Map<String, Value>) {
        (doc.id.clone(), unescape_map(&doc.fields))
    }

    /// Encode a field-level diff as a store partial-update instruction.
    pub fn encode_update(&self, spec: &UpdateSpec) -> StoreUpdate {
        StoreUpdate {
            set: spec
                .set
                .iter()
                .map(|(k, v)| (escape_path(k), escape_value(v)))
                .collect(),
            unset: spec.unset.iter().map(|p| escape_path(p)).collect(),
        }
    }

    /// Encode a binary file: metadata fields plus the content per the
    /// configured [`BinaryPolicy`].
    pub fn encode_file(
        &self,
        id: &Value,
        metadata: &Map<String, Value>,
        content: &[u8],
    ) -> Result<StoreDocument> {
        let mut doc = self.encode(id, metadata)?;
        match self.binary_policy {
            BinaryPolicy::Base64 => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(content);
                doc.fields.insert("content".to_string(), Value::String(encoded));
            }
            BinaryPolicy::Omit => {}
        }
        Ok(doc)
    }
}

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Escape one key: reserved keys and keys already starting with `~` gain a
/// leading `~`. Injective by construction.
fn escape_key(key: &str) -> String {
    if is_reserved(key) || key.starts_with('~') {
        format!("~{key}")
    } else {
        key.to_string()
    }
}

/// Escape each segment of a dotted path independently.
fn escape_path(path: &str) -> String {
    path.split('.').map(escape_key).collect::<Vec<_>>().join(".")
}

fn unescape_key(key: &str) -> String {
    key.strip_prefix('~').unwrap_or(key).to_string()
}

fn escape_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(escape_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(escape_value).collect()),
        other => other.clone(),
    }
}

fn escape_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (escape_key(k), escape_value(v)))
        .collect()
}

fn unescape_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(unescape_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(unescape_value).collect()),
        other => other.clone(),
    }
}

fn unescape_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (unescape_key(k), unescape_value(v)))
        .collect()
}

/// Set a dotted path, creating intermediate objects. A non-object in the
/// middle of the path is replaced.
fn set_path(fields: &mut Map<String, Value>, path: &str, value: Value) {
    let mut current = fields;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry
            .as_object_mut()
            .unwrap_or_else(|| unreachable!("entry was just made an object"));
    }
}

/// Remove a dotted path. Missing intermediates are a no-op.
fn unset_path(fields: &mut Map<String, Value>, path: &str) {
    let mut current = fields;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.remove(segment);
            return;
        }
        match current.get_mut(segment).and_then(Value::as_object_mut) {
            Some(next) => current = next,
            None => return,
        }
    }
}
