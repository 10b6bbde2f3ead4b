#![forbid(unsafe_code)]

//! Backing-store capability contract.
//!
//! The bitemporal store only needs a handful of document operations plus a
//! few filtered bulk updates. Any engine that can answer them with the two
//! composite indexes described by [`IndexSpec::required`] can host a graph.

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::types::{doc_i64_opt, fields, valid_at, CollectionKind, Document, IndexSpec, Timestamp};

/// Selects documents for bulk operations.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Valid at `timestamp` and `last_version != version`.
    ValidWithoutLastVersion {
        /// Point in system time that must fall inside `[created, expired]`.
        timestamp: Timestamp,
        /// Version that exempts a document from the match.
        version: String,
    },
    /// `created == timestamp`.
    CreatedAt(Timestamp),
    /// `expired == timestamp`.
    ExpiredAt(Timestamp),
    /// `last_version == version`.
    LastVersion(String),
    /// Top-level field equals a JSON value.
    FieldEquals(String, Value),
}

impl Filter {
    /// Evaluates the filter against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::ValidWithoutLastVersion { timestamp, version } => {
                valid_at(doc, *timestamp)
                    && doc.get(fields::LAST_VERSION).and_then(Value::as_str) != Some(version.as_str())
            }
            Filter::CreatedAt(ts) => doc_i64_opt(doc, fields::CREATED) == Some(*ts),
            Filter::ExpiredAt(ts) => doc_i64_opt(doc, fields::EXPIRED) == Some(*ts),
            Filter::LastVersion(version) => {
                doc.get(fields::LAST_VERSION).and_then(Value::as_str) == Some(version.as_str())
            }
            Filter::FieldEquals(field, value) => doc.get(field) == Some(value),
        }
    }
}

/// Field assignments applied to every matched document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Patch {
    sets: Vec<(String, Value)>,
}

impl Patch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field assignment.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sets.push((field.into(), value.into()));
        self
    }

    /// Returns the assignments in insertion order.
    pub fn assignments(&self) -> &[(String, Value)] {
        &self.sets
    }

    /// Applies the patch in place.
    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.sets {
            doc.insert(field.clone(), value.clone());
        }
    }

    /// Returns `true` when the patch assigns nothing.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Edge documents must carry string `_from` and `_to` fields.
pub(crate) fn check_edge_document(kind: CollectionKind, name: &str, doc: &Document) -> Result<()> {
    if kind == CollectionKind::Edge {
        for field in [fields::FROM, fields::TO] {
            if !matches!(doc.get(field), Some(Value::String(_))) {
                return Err(GraphError::InvalidDocument(format!(
                    "edge document in {name} is missing '{field}'"
                )));
            }
        }
    }
    Ok(())
}

/// Storage engine able to host bitemporal collections.
///
/// Collections are addressed by name. Documents are keyed by their `_key`
/// field; implementations must reject documents without one.
pub trait DocumentBackend: Send + Sync {
    /// Creates a collection. Creating an existing collection of the same kind is a no-op.
    fn create_collection(&self, name: &str, kind: CollectionKind) -> Result<()>;

    /// Returns the kind of a collection, or `None` if it does not exist.
    fn collection_kind(&self, name: &str) -> Result<Option<CollectionKind>>;

    /// Creates a persistent, non-unique index if an equivalent one is missing.
    fn ensure_index(&self, name: &str, spec: &IndexSpec) -> Result<()>;

    /// Lists the persistent indexes of a collection.
    fn indexes(&self, name: &str) -> Result<Vec<IndexSpec>>;

    /// Inserts a new document; fails with `DuplicateKey` if `_key` exists.
    fn insert(&self, name: &str, doc: Document) -> Result<()>;

    /// Fetches a document by key.
    fn get(&self, name: &str, key: &str) -> Result<Option<Document>>;

    /// Applies a patch to one document. Returns `false` if the key is absent.
    fn update(&self, name: &str, key: &str, patch: &Patch) -> Result<bool>;

    /// Removes one document. Returns `false` if the key is absent.
    fn remove(&self, name: &str, key: &str) -> Result<bool>;

    /// Upserts by `_key`: new keys are inserted, fields of existing keys are
    /// overwritten by the incoming fields and other fields are kept.
    fn import_bulk(&self, name: &str, docs: Vec<Document>) -> Result<()>;

    /// Returns every document whose `id` is in `ids` and which is valid at `timestamp`.
    fn find_valid(&self, name: &str, ids: &[String], timestamp: Timestamp)
        -> Result<Vec<Document>>;

    /// Returns every document matching the filter.
    fn find_where(&self, name: &str, filter: &Filter) -> Result<Vec<Document>>;

    /// Patches every document matching the filter; returns the number changed.
    fn update_where(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<u64>;

    /// Removes every document matching the filter; returns the number removed.
    fn remove_where(&self, name: &str, filter: &Filter) -> Result<u64>;
}
