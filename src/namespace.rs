//! Namespace mapping: upstream (database, collection) to store (index, type).
//!
//! The mapper is a pure function with no state. Index names are normalized
//! to what the store accepts (lowercase, no reserved characters); the
//! collection name passes through as the document type.

use crate::error::{DocManagerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An upstream logical namespace: one collection within one database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse a `"database.collection"` pair. The collection part may itself
    /// contain dots (only the first separates).
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
                Ok(Self::new(db, coll))
            }
            _ => Err(DocManagerError::Config(format!(
                "invalid namespace {s:?}: expected \"database.collection\""
            ))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// The store-side target for a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexMapping {
    /// Store index name (normalized).
    pub index: String,
    /// Document type within the index.
    pub doc_type: String,
}

/// Translates namespaces into store index/type pairs.
///
/// Pure and deterministic: the same namespace always maps to the same
/// target, so mapping can happen anywhere without coordination.
#[derive(Debug, Clone, Default)]
pub struct NamespaceMapper;

impl NamespaceMapper {
    pub fn new() -> Self {
        Self
    }

    /// Map a namespace to its index/type target.
    ///
    /// The index is the lowercased database name with characters the store
    /// rejects in index names replaced by `_`. The doc type is the
    /// collection name unchanged.
    pub fn map(&self, ns: &Namespace) -> IndexMapping {
        IndexMapping {
            index: Self::normalize_index(&ns.database),
            doc_type: ns.collection.clone(),
        }
    }

    fn normalize_index(database: &str) -> String {
        database
            .chars()
            .map(|c| match c.to_ascii_lowercase() {
                c if c.is_ascii_alphanumeric() || c == '-' || c == '.' => c,
                _ => '_',
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let ns = Namespace::parse("test.users").unwrap();
        assert_eq!(ns.database, "test");
        assert_eq!(ns.collection, "users");
        assert_eq!(ns.to_string(), "test.users");
    }

    #[test]
    fn test_parse_dotted_collection() {
        let ns = Namespace::parse("db.coll.sub").unwrap();
        assert_eq!(ns.database, "db");
        assert_eq!(ns.collection, "coll.sub");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".coll").is_err());
        assert!(Namespace::parse("db.").is_err());
        assert!(Namespace::parse("").is_err());
    }

    #[test]
    fn test_map_lowercases_index() {
        let mapper = NamespaceMapper::new();
        let mapping = mapper.map(&Namespace::new("MyDB", "Users"));
        assert_eq!(mapping.index, "mydb");
        assert_eq!(mapping.doc_type, "Users");
    }

    #[test]
    fn test_map_replaces_forbidden_chars() {
        let mapper = NamespaceMapper::new();
        let mapping = mapper.map(&Namespace::new("my db/2024", "logs"));
        assert_eq!(mapping.index, "my_db_2024");
    }

    #[test]
    fn test_map_is_deterministic() {
        let mapper = NamespaceMapper::new();
        let ns = Namespace::new("Test", "things");
        assert_eq!(mapper.map(&ns), mapper.map(&ns));
    }
}
