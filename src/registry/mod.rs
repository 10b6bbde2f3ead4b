//! Durable log of load attempts per namespace.
//!
//! One record per `(namespace, version)` keyed by `namespace + "_" + version`.
//! The insert-only start record doubles as the guard against loading the same
//! version twice; rollback reads the two newest records to learn what to undo.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::storage::{DocumentBackend, Filter, Patch};
use crate::types::{fields, full_id, CollectionKind, Document, Timestamp};

const FLD_STATE: &str = "state";
const FLD_COMPLETE_TIME: &str = "completion_time";
const FLD_NAMESPACE: &str = "load_namespace";

/// Lifecycle state of a registered load.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// Started and not yet completed (or crashed).
    InProgress,
    /// All passes finished.
    Complete,
    /// Being reverted.
    Rollback,
}

impl LoadState {
    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            LoadState::InProgress => "in_progress",
            LoadState::Complete => "complete",
            LoadState::Rollback => "rollback",
        }
    }
}

/// Collections touched by one load.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LoadCollections {
    /// Vertex collection.
    pub vertex: String,
    /// Ordinary edge collections, sorted.
    pub edges: Vec<String>,
    /// Merge edge collection, if any.
    pub merge: Option<String>,
}

/// One registry record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Namespace of the data set, e.g. `ncbi_taxa`.
    pub load_namespace: String,
    /// Version label, unique within the namespace.
    pub load_version: String,
    /// System time at which the load becomes active.
    pub load_timestamp: Timestamp,
    /// Time the source released the data.
    pub release_timestamp: Timestamp,
    /// Wall-clock time the load started.
    pub start_time: Timestamp,
    /// Wall-clock time the load completed.
    pub completion_time: Option<Timestamp>,
    /// Lifecycle state.
    pub state: LoadState,
    /// Vertex collection written by the load.
    pub vertex_collection: String,
    /// Edge collections written by the load, sorted.
    pub edge_collections: Vec<String>,
    /// Merge collection written by the load.
    pub merge_collection: Option<String>,
}

impl RegistryEntry {
    /// Registry key for a namespace and version.
    pub fn key_for(namespace: &str, version: &str) -> String {
        format!("{namespace}_{version}")
    }

    /// Every collection bound to this load: vertex, edges, then merge.
    pub fn collections(&self) -> Vec<&str> {
        let mut out = vec![self.vertex_collection.as_str()];
        out.extend(self.edge_collections.iter().map(String::as_str));
        if let Some(merge) = &self.merge_collection {
            out.push(merge.as_str());
        }
        out
    }

    fn to_document(&self, collection: &str) -> Result<Document> {
        let key = Self::key_for(&self.load_namespace, &self.load_version);
        let Value::Object(mut doc) = serde_json::to_value(self)? else {
            return Err(GraphError::Corruption(
                "registry entry did not serialize to an object".into(),
            ));
        };
        doc.insert(fields::FULL_ID.into(), Value::String(full_id(collection, &key)));
        doc.insert(fields::KEY.into(), Value::String(key));
        Ok(doc)
    }

    fn from_document(doc: Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> Timestamp {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as Timestamp
}

/// Handle on the registry collection.
#[derive(Clone)]
pub struct LoadRegistry {
    backend: Arc<dyn DocumentBackend>,
    collection: String,
}

impl std::fmt::Debug for LoadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadRegistry")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl LoadRegistry {
    /// Binds to an existing vertex-kind collection.
    pub fn open(backend: Arc<dyn DocumentBackend>, collection: &str) -> Result<Self> {
        match backend.collection_kind(collection)? {
            Some(CollectionKind::Vertex) => Ok(Self {
                backend,
                collection: collection.to_string(),
            }),
            Some(CollectionKind::Edge) => Err(GraphError::configuration(format!(
                "{collection} is not a vertex collection"
            ))),
            None => Err(GraphError::configuration(format!(
                "registry collection {collection} does not exist"
            ))),
        }
    }

    /// Name of the registry collection.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Records that a load is starting.
    ///
    /// Fails with [`GraphError::DuplicateLoad`] if the namespace and version
    /// were registered before, whatever their state.
    pub fn register_load_start(
        &self,
        namespace: &str,
        version: &str,
        load_timestamp: Timestamp,
        release_timestamp: Timestamp,
        current_time: Timestamp,
        collections: &LoadCollections,
    ) -> Result<RegistryEntry> {
        let mut edge_collections = collections.edges.clone();
        edge_collections.sort();
        let entry = RegistryEntry {
            load_namespace: namespace.to_string(),
            load_version: version.to_string(),
            load_timestamp,
            release_timestamp,
            start_time: current_time,
            completion_time: None,
            state: LoadState::InProgress,
            vertex_collection: collections.vertex.clone(),
            edge_collections,
            merge_collection: collections.merge.clone(),
        };
        match self
            .backend
            .insert(&self.collection, entry.to_document(&self.collection)?)
        {
            Ok(()) => {}
            Err(GraphError::DuplicateKey { .. }) => {
                return Err(GraphError::DuplicateLoad {
                    namespace: namespace.to_string(),
                    version: version.to_string(),
                })
            }
            Err(other) => return Err(other),
        }
        debug!(namespace, version, load_timestamp, "registry.load_started");
        Ok(entry)
    }

    /// Marks a load complete.
    pub fn register_load_complete(
        &self,
        namespace: &str,
        version: &str,
        current_time: Timestamp,
    ) -> Result<()> {
        let patch = Patch::new()
            .set(FLD_COMPLETE_TIME, current_time)
            .set(FLD_STATE, LoadState::Complete.as_str());
        self.patch_entry(namespace, version, &patch)?;
        debug!(namespace, version, "registry.load_completed");
        Ok(())
    }

    /// Marks a load as being rolled back.
    pub fn register_load_rollback(&self, namespace: &str, version: &str) -> Result<()> {
        let patch = Patch::new().set(FLD_STATE, LoadState::Rollback.as_str());
        self.patch_entry(namespace, version, &patch)
    }

    /// All loads of a namespace, newest `load_timestamp` first.
    pub fn get_registered_loads(&self, namespace: &str) -> Result<Vec<RegistryEntry>> {
        let filter = Filter::FieldEquals(FLD_NAMESPACE.into(), Value::String(namespace.into()));
        let mut entries = self
            .backend
            .find_where(&self.collection, &filter)?
            .into_iter()
            .map(RegistryEntry::from_document)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| b.load_timestamp.cmp(&a.load_timestamp));
        Ok(entries)
    }

    /// Fetches one registry entry.
    pub fn get_registered_load(
        &self,
        namespace: &str,
        version: &str,
    ) -> Result<Option<RegistryEntry>> {
        self.backend
            .get(&self.collection, &RegistryEntry::key_for(namespace, version))?
            .map(RegistryEntry::from_document)
            .transpose()
    }

    /// Removes a load from the registry.
    pub fn delete_registered_load(&self, namespace: &str, version: &str) -> Result<()> {
        let key = RegistryEntry::key_for(namespace, version);
        if self.backend.remove(&self.collection, &key)? {
            Ok(())
        } else {
            Err(not_registered(namespace, version))
        }
    }

    fn patch_entry(&self, namespace: &str, version: &str, patch: &Patch) -> Result<()> {
        let key = RegistryEntry::key_for(namespace, version);
        if self.backend.update(&self.collection, &key, patch)? {
            Ok(())
        } else {
            Err(not_registered(namespace, version))
        }
    }
}

fn not_registered(namespace: &str, version: &str) -> GraphError {
    GraphError::NotRegistered {
        namespace: namespace.to_string(),
        version: version.to_string(),
    }
}
