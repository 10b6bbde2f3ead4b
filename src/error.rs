use std::io;
use thiserror::Error;

use crate::types::Timestamp;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised by the store, the delta loader, and rollback.
///
/// None of these are retried internally. An error raised mid-load leaves the
/// namespace inconsistent until the load is rolled back.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Misconfigured store or load: missing index, wrong collection type,
    /// merge source without a merge collection, and similar.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A load with this namespace and version is already registered.
    #[error("load {version} in namespace {namespace} is already registered")]
    DuplicateLoad {
        /// Load namespace.
        namespace: String,
        /// Load version.
        version: String,
    },
    /// No registry entry exists for this namespace and version.
    #[error("load {version} in namespace {namespace} is not registered")]
    NotRegistered {
        /// Load namespace.
        namespace: String,
        /// Load version.
        version: String,
    },
    /// An edge names a collection that was not registered with the store.
    #[error("collection {0} was not registered at initialization")]
    UnknownCollection(String),
    /// More than one version of an entity is valid at a single timestamp.
    #[error("collection {collection} contains more than one document for id {id} at timestamp {timestamp}")]
    AmbiguousLookup {
        /// Collection searched.
        collection: String,
        /// External id with overlapping versions.
        id: String,
        /// Lookup timestamp.
        timestamp: Timestamp,
    },
    /// Rollback requires at least two registered loads.
    #[error("namespace {namespace} has {registered} registered load(s); at least 2 are required to roll back")]
    NothingToRollBack {
        /// Load namespace.
        namespace: String,
        /// Number of registry entries found.
        registered: usize,
    },
    /// An incoming or stored document is missing a required field.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    /// An edge references a vertex that does not exist at the load timestamp.
    #[error("edge {edge} references vertex {vertex}, which does not exist at the load timestamp")]
    MissingEndpoint {
        /// External edge id.
        edge: String,
        /// External vertex id that failed to resolve.
        vertex: String,
    },
    /// Insert of a document whose key already exists.
    #[error("document {key} already exists in collection {collection}")]
    DuplicateKey {
        /// Target collection.
        collection: String,
        /// Conflicting `_key`.
        key: String,
    },
    /// SQLite backend failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// I/O failure reading a source.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Stored data violates an invariant the backend relies on.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl GraphError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        GraphError::Configuration(msg.into())
    }
}
