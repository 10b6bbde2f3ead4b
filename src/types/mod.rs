//! Shared document model for the bitemporal graph store.
//!
//! Every vertex and edge version is persisted as an open JSON object. A small
//! set of reserved fields carries identity and the two validity intervals;
//! everything else is opaque payload that the loader only compares.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GraphError, Result};

/// Integer timestamp in Unix epoch milliseconds.
pub type Timestamp = i64;

/// A stored or incoming entity: an insertion-ordered JSON object.
pub type Document = Map<String, Value>;

/// Sentinel expiry for live versions. The largest integer a double can carry
/// without loss, so it survives any JSON round trip. In epoch ms this is 2255-06-05.
pub const INF: Timestamp = 9_007_199_254_740_991;

/// Persisted field names.
pub mod fields {
    /// Internal unique key of one version: `id + "_" + version`.
    pub const KEY: &str = "_key";
    /// Fully qualified internal key: `collection + "/" + _key`.
    pub const FULL_ID: &str = "_id";
    /// External id, stable across versions.
    pub const ID: &str = "id";
    /// `_id` of the vertex version an edge originates from.
    pub const FROM: &str = "_from";
    /// External id of the vertex an edge originates from.
    pub const FROM_ID: &str = "from";
    /// `_id` of the vertex version an edge terminates at.
    pub const TO: &str = "_to";
    /// External id of the vertex an edge terminates at.
    pub const TO_ID: &str = "to";
    /// Load version in which this entity version was created.
    pub const FIRST_VERSION: &str = "first_version";
    /// Most recent load version that saw this entity version.
    pub const LAST_VERSION: &str = "last_version";
    /// Start of the system-time interval (inclusive).
    pub const CREATED: &str = "created";
    /// End of the system-time interval (inclusive).
    pub const EXPIRED: &str = "expired";
    /// Start of the release-time interval.
    pub const RELEASE_CREATED: &str = "release_created";
    /// End of the release-time interval.
    pub const RELEASE_EXPIRED: &str = "release_expired";
    /// Transient routing field on incoming edges naming their target collection.
    pub const COLLECTION: &str = "_collection";
}

/// Fields ignored when deciding whether an entity changed between loads.
const PAYLOAD_IGNORED_FIELDS: &[&str] = &[
    fields::KEY,
    fields::FULL_ID,
    fields::FROM,
    fields::TO,
    fields::CREATED,
    fields::EXPIRED,
    fields::RELEASE_CREATED,
    fields::RELEASE_EXPIRED,
    fields::FIRST_VERSION,
    fields::LAST_VERSION,
    fields::COLLECTION,
];

/// Type of a collection. Vertex collections hold plain documents, edge
/// collections additionally require `_from` / `_to`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// Document collection (vertices, the load registry).
    Vertex,
    /// Edge collection (ordinary edges, merge edges).
    Edge,
}

impl CollectionKind {
    /// Human readable label used in error messages.
    pub fn describe(self) -> &'static str {
        match self {
            CollectionKind::Vertex => "a vertex",
            CollectionKind::Edge => "an edge",
        }
    }
}

/// An ordered list of fields covered by a persistent, non-unique index.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed fields in index order.
    pub fields: Vec<String>,
}

impl IndexSpec {
    /// Builds an index description from field names.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Index used for point-in-time lookup by external id.
    pub fn id_expired_created() -> Self {
        Self::new([fields::ID, fields::EXPIRED, fields::CREATED])
    }

    /// Index used by the bulk expiry sweeps.
    pub fn expired_created_last_version() -> Self {
        Self::new([fields::EXPIRED, fields::CREATED, fields::LAST_VERSION])
    }

    /// Both indexes every versioned collection must carry.
    pub fn required() -> [IndexSpec; 2] {
        [Self::id_expired_created(), Self::expired_created_last_version()]
    }
}

impl std::fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.fields.join(", "))
    }
}

/// Returns `true` when the two documents are equal once reserved fields are removed.
pub fn payload_equal(a: &Document, b: &Document) -> bool {
    let visible = |doc: &Document| {
        doc.iter()
            .filter(|(k, _)| !PAYLOAD_IGNORED_FIELDS.contains(&k.as_str()))
            .count()
    };
    if visible(a) != visible(b) {
        return false;
    }
    a.iter()
        .filter(|(k, _)| !PAYLOAD_IGNORED_FIELDS.contains(&k.as_str()))
        .all(|(k, v)| b.get(k) == Some(v))
}

/// Returns `true` when `doc` is valid at `timestamp` on the system-time axis.
pub fn valid_at(doc: &Document, timestamp: Timestamp) -> bool {
    match (doc_i64_opt(doc, fields::CREATED), doc_i64_opt(doc, fields::EXPIRED)) {
        (Some(created), Some(expired)) => created <= timestamp && timestamp <= expired,
        _ => false,
    }
}

/// Reads a required string field.
pub fn doc_str<'a>(doc: &'a Document, field: &str) -> Result<&'a str> {
    match doc.get(field) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(GraphError::InvalidDocument(format!(
            "field '{field}' must be a string, found {other}"
        ))),
        None => Err(GraphError::InvalidDocument(format!(
            "missing required field '{field}'"
        ))),
    }
}

/// Reads a required integer field.
pub fn doc_i64(doc: &Document, field: &str) -> Result<i64> {
    doc_i64_opt(doc, field).ok_or_else(|| {
        GraphError::InvalidDocument(format!("missing or non-integer field '{field}'"))
    })
}

/// Reads an optional integer field.
pub fn doc_i64_opt(doc: &Document, field: &str) -> Option<i64> {
    doc.get(field).and_then(Value::as_i64)
}

/// Builds the internal key of an entity version.
pub fn version_key(id: &str, version: &str) -> String {
    format!("{id}_{version}")
}

/// Builds the fully qualified `_id` of a document.
pub fn full_id(collection: &str, key: &str) -> String {
    format!("{collection}/{key}")
}

/// Checks a collection name: an ASCII letter followed by letters, digits, `_` or `-`.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(GraphError::Configuration(format!(
            "illegal collection name '{name}'"
        )))
    }
}
