#![forbid(unsafe_code)]

//! Bitemporal view over a set of typed collections.
//!
//! A [`BitemporalStore`] binds one vertex collection, one or more edge
//! collections, an optional merge collection and the load registry. Every
//! versioned collection is checked for both composite indexes from
//! [`IndexSpec::required`] when the store opens; a store never runs against
//! an unindexed collection.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{error, info};

use crate::batch::BatchUpdater;
use crate::error::{GraphError, Result};
use crate::registry::{LoadCollections, LoadRegistry};
use crate::storage::{DocumentBackend, Filter, Patch};
use crate::types::{
    doc_str, fields, full_id, version_key, CollectionKind, Document, IndexSpec, Timestamp, INF,
};

/// Version label and the two interval starts written on every new version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionStamp {
    /// Load version that creates the document.
    pub version: String,
    /// Start of the system-time interval.
    pub created: Timestamp,
    /// Start of the release-time interval.
    pub release_created: Timestamp,
}

impl VersionStamp {
    /// Creates a stamp.
    pub fn new(version: impl Into<String>, created: Timestamp, release_created: Timestamp) -> Self {
        Self {
            version: version.into(),
            created,
            release_created,
        }
    }
}

/// Builds a new live vertex version from an incoming payload.
pub(crate) fn new_vertex_document(
    collection: &str,
    id: &str,
    stamp: &VersionStamp,
    payload: &Document,
) -> Document {
    let mut doc = payload.clone();
    doc.remove(fields::COLLECTION);
    let key = version_key(id, &stamp.version);
    doc.insert(fields::FULL_ID.into(), Value::String(full_id(collection, &key)));
    doc.insert(fields::KEY.into(), Value::String(key));
    doc.insert(fields::ID.into(), Value::String(id.to_string()));
    stamp_live(&mut doc, stamp);
    doc
}

/// Builds a new live edge version pointing at two stored vertex versions.
pub(crate) fn new_edge_document(
    collection: &str,
    id: &str,
    from_vertex: &Document,
    to_vertex: &Document,
    stamp: &VersionStamp,
    payload: Option<&Document>,
) -> Result<Document> {
    let mut doc = payload.cloned().unwrap_or_default();
    doc.remove(fields::COLLECTION);
    let key = version_key(id, &stamp.version);
    doc.insert(fields::FULL_ID.into(), Value::String(full_id(collection, &key)));
    doc.insert(fields::KEY.into(), Value::String(key));
    doc.insert(fields::ID.into(), Value::String(id.to_string()));
    doc.insert(fields::FROM.into(), doc_str(from_vertex, fields::FULL_ID)?.into());
    doc.insert(fields::FROM_ID.into(), doc_str(from_vertex, fields::ID)?.into());
    doc.insert(fields::TO.into(), doc_str(to_vertex, fields::FULL_ID)?.into());
    doc.insert(fields::TO_ID.into(), doc_str(to_vertex, fields::ID)?.into());
    stamp_live(&mut doc, stamp);
    Ok(doc)
}

fn stamp_live(doc: &mut Document, stamp: &VersionStamp) {
    doc.insert(fields::FIRST_VERSION.into(), stamp.version.clone().into());
    doc.insert(fields::LAST_VERSION.into(), stamp.version.clone().into());
    doc.insert(fields::CREATED.into(), stamp.created.into());
    doc.insert(fields::EXPIRED.into(), INF.into());
    doc.insert(fields::RELEASE_CREATED.into(), stamp.release_created.into());
    doc.insert(fields::RELEASE_EXPIRED.into(), INF.into());
}

/// Patch ending both validity intervals.
pub(crate) fn expire_patch(timestamp: Timestamp, release_timestamp: Timestamp) -> Patch {
    Patch::new()
        .set(fields::EXPIRED, timestamp)
        .set(fields::RELEASE_EXPIRED, release_timestamp)
}

/// Collections and backend a [`BitemporalStore`] binds to.
#[derive(Clone)]
pub struct StoreOptions {
    backend: Arc<dyn DocumentBackend>,
    registry_collection: String,
    vertex_collection: String,
    default_edge_collection: Option<String>,
    edge_collections: Vec<String>,
    merge_collection: Option<String>,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("registry_collection", &self.registry_collection)
            .field("vertex_collection", &self.vertex_collection)
            .field("default_edge_collection", &self.default_edge_collection)
            .field("edge_collections", &self.edge_collections)
            .field("merge_collection", &self.merge_collection)
            .finish_non_exhaustive()
    }
}

impl StoreOptions {
    /// Starts a configuration with the mandatory registry and vertex collections.
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        registry_collection: impl Into<String>,
        vertex_collection: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            registry_collection: registry_collection.into(),
            vertex_collection: vertex_collection.into(),
            default_edge_collection: None,
            edge_collections: Vec::new(),
            merge_collection: None,
        }
    }

    /// Edge collection used when an edge names none.
    pub fn default_edge_collection(mut self, name: impl Into<String>) -> Self {
        self.default_edge_collection = Some(name.into());
        self
    }

    /// Additional edge collections edges may route to through `_collection`.
    pub fn edge_collections<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edge_collections = names.into_iter().map(Into::into).collect();
        self
    }

    /// Collection receiving merge edges.
    pub fn merge_collection(mut self, name: impl Into<String>) -> Self {
        self.merge_collection = Some(name.into());
        self
    }

    /// Every non-merge edge collection, default first, deduplicated.
    fn all_edge_collections(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.default_edge_collection
            .iter()
            .chain(self.edge_collections.iter())
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Time-travelling store bound to one namespace's collections.
#[derive(Clone)]
pub struct BitemporalStore {
    backend: Arc<dyn DocumentBackend>,
    registry: LoadRegistry,
    vertex_collection: String,
    default_edge_collection: Option<String>,
    edge_collections: Vec<String>,
    merge_collection: Option<String>,
}

impl std::fmt::Debug for BitemporalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitemporalStore")
            .field("registry", &self.registry)
            .field("vertex_collection", &self.vertex_collection)
            .field("default_edge_collection", &self.default_edge_collection)
            .field("edge_collections", &self.edge_collections)
            .field("merge_collection", &self.merge_collection)
            .finish_non_exhaustive()
    }
}

impl BitemporalStore {
    /// Creates any missing collections and indexes, then opens the store.
    pub fn create(opts: StoreOptions) -> Result<Self> {
        let backend = &opts.backend;
        backend.create_collection(&opts.registry_collection, CollectionKind::Vertex)?;
        backend.create_collection(&opts.vertex_collection, CollectionKind::Vertex)?;
        let mut versioned = vec![opts.vertex_collection.clone()];
        for name in opts.all_edge_collections() {
            backend.create_collection(&name, CollectionKind::Edge)?;
            versioned.push(name);
        }
        if let Some(merge) = &opts.merge_collection {
            backend.create_collection(merge, CollectionKind::Edge)?;
            versioned.push(merge.clone());
        }
        for name in &versioned {
            for spec in IndexSpec::required() {
                backend.ensure_index(name, &spec)?;
            }
        }
        Self::open(opts)
    }

    /// Binds to existing collections.
    ///
    /// Fails with [`GraphError::Configuration`] when no edge collection is
    /// named, when a collection is missing or of the wrong kind, or when a
    /// versioned collection lacks one of the required indexes.
    pub fn open(opts: StoreOptions) -> Result<Self> {
        let edge_collections = opts.all_edge_collections();
        if edge_collections.is_empty() {
            return Err(GraphError::configuration(
                "at least one edge collection must be specified",
            ));
        }
        if let Some(merge) = &opts.merge_collection {
            if edge_collections.contains(merge) {
                return Err(GraphError::configuration(format!(
                    "{merge} cannot be both an edge and the merge collection"
                )));
            }
        }
        let backend = opts.backend;
        let registry = LoadRegistry::open(Arc::clone(&backend), &opts.registry_collection)?;
        check_kind(backend.as_ref(), &opts.vertex_collection, CollectionKind::Vertex)?;
        for name in edge_collections.iter().chain(opts.merge_collection.iter()) {
            check_kind(backend.as_ref(), name, CollectionKind::Edge)?;
        }
        for name in std::iter::once(&opts.vertex_collection)
            .chain(edge_collections.iter())
            .chain(opts.merge_collection.iter())
        {
            check_indexes(backend.as_ref(), name)?;
        }

        let mut sorted = edge_collections;
        sorted.sort();
        info!(
            registry = %opts.registry_collection,
            vertex_collection = %opts.vertex_collection,
            edge_collections = sorted.len(),
            merge_collection = opts.merge_collection.as_deref().unwrap_or("-"),
            "store.open"
        );
        Ok(Self {
            backend,
            registry,
            vertex_collection: opts.vertex_collection,
            default_edge_collection: opts.default_edge_collection,
            edge_collections: sorted,
            merge_collection: opts.merge_collection,
        })
    }

    /// Backend the store runs against.
    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Load registry bound to this store.
    pub fn registry(&self) -> &LoadRegistry {
        &self.registry
    }

    /// Name of the vertex collection.
    pub fn vertex_collection(&self) -> &str {
        &self.vertex_collection
    }

    /// Name of the default edge collection, if one was configured.
    pub fn default_edge_collection(&self) -> Option<&str> {
        self.default_edge_collection.as_deref()
    }

    /// Sorted non-merge edge collections, including the default.
    pub fn edge_collections(&self) -> &[String] {
        &self.edge_collections
    }

    /// Name of the merge collection, if one was configured.
    pub fn merge_collection(&self) -> Option<&str> {
        self.merge_collection.as_deref()
    }

    /// Collection set recorded in the registry for loads through this store.
    pub fn load_collections(&self) -> LoadCollections {
        LoadCollections {
            vertex: self.vertex_collection.clone(),
            edges: self.edge_collections.clone(),
            merge: self.merge_collection.clone(),
        }
    }

    /// Vertices valid at `timestamp`, keyed by external id. Missing ids are omitted.
    pub fn get_vertices(
        &self,
        ids: &[String],
        timestamp: Timestamp,
    ) -> Result<FxHashMap<String, Document>> {
        self.get_documents(&self.vertex_collection, ids, timestamp)
    }

    /// Edges valid at `timestamp`, keyed by external id.
    ///
    /// `None` selects the default edge collection. The merge collection may be
    /// named explicitly.
    pub fn get_edges(
        &self,
        ids: &[String],
        timestamp: Timestamp,
        collection: Option<&str>,
    ) -> Result<FxHashMap<String, Document>> {
        let name = self.edge_collection(collection)?;
        self.get_documents(name, ids, timestamp)
    }

    fn get_documents(
        &self,
        collection: &str,
        ids: &[String],
        timestamp: Timestamp,
    ) -> Result<FxHashMap<String, Document>> {
        let mut out = FxHashMap::default();
        if ids.is_empty() {
            return Ok(out);
        }
        let unique: BTreeSet<&String> = ids.iter().collect();
        let ids: Vec<String> = unique.into_iter().cloned().collect();
        for doc in self.backend.find_valid(collection, &ids, timestamp)? {
            let id = doc_str(&doc, fields::ID)?.to_string();
            if out.contains_key(&id) {
                error!(collection, id = %id, timestamp, "store.ambiguous_lookup");
                return Err(GraphError::AmbiguousLookup {
                    collection: collection.to_string(),
                    id,
                    timestamp,
                });
            }
            out.insert(id, doc);
        }
        Ok(out)
    }

    /// Saves a new vertex version and returns its key.
    pub fn insert_vertex(&self, id: &str, stamp: &VersionStamp, payload: &Document) -> Result<String> {
        let doc = new_vertex_document(&self.vertex_collection, id, stamp, payload);
        let key = doc_str(&doc, fields::KEY)?.to_string();
        self.backend.insert(&self.vertex_collection, doc)?;
        Ok(key)
    }

    /// Saves a new edge version between two stored vertex versions and returns its key.
    pub fn insert_edge(
        &self,
        id: &str,
        from_vertex: &Document,
        to_vertex: &Document,
        stamp: &VersionStamp,
        payload: Option<&Document>,
        collection: Option<&str>,
    ) -> Result<String> {
        let name = self.edge_collection(collection)?;
        let doc = new_edge_document(name, id, from_vertex, to_vertex, stamp, payload)?;
        let key = doc_str(&doc, fields::KEY)?.to_string();
        self.backend.insert(name, doc)?;
        Ok(key)
    }

    /// Marks a vertex version as seen in `version`.
    pub fn set_last_version_on_vertex(&self, key: &str, version: &str) -> Result<()> {
        let patch = Patch::new().set(fields::LAST_VERSION, version);
        self.update_one(&self.vertex_collection, key, &patch)
    }

    /// Marks an edge version as seen in `version`.
    pub fn set_last_version_on_edge(
        &self,
        key: &str,
        version: &str,
        collection: Option<&str>,
    ) -> Result<()> {
        let name = self.edge_collection(collection)?;
        let patch = Patch::new().set(fields::LAST_VERSION, version);
        self.update_one(name, key, &patch)
    }

    /// Ends both validity intervals of a vertex version.
    pub fn expire_vertex(
        &self,
        key: &str,
        timestamp: Timestamp,
        release_timestamp: Timestamp,
    ) -> Result<()> {
        self.update_one(
            &self.vertex_collection,
            key,
            &expire_patch(timestamp, release_timestamp),
        )
    }

    /// Ends both validity intervals of an edge version.
    pub fn expire_edge(
        &self,
        key: &str,
        timestamp: Timestamp,
        release_timestamp: Timestamp,
        collection: Option<&str>,
    ) -> Result<()> {
        let name = self.edge_collection(collection)?;
        self.update_one(name, key, &expire_patch(timestamp, release_timestamp))
    }

    /// Expires every vertex valid at `timestamp` whose `last_version` is not `version`.
    pub fn expire_extant_vertices_without_last_version(
        &self,
        timestamp: Timestamp,
        release_timestamp: Timestamp,
        version: &str,
    ) -> Result<u64> {
        self.expire_extant(&self.vertex_collection, timestamp, release_timestamp, version)
    }

    /// Expires every edge valid at `timestamp` whose `last_version` is not `version`.
    pub fn expire_extant_edges_without_last_version(
        &self,
        timestamp: Timestamp,
        release_timestamp: Timestamp,
        version: &str,
        collection: Option<&str>,
    ) -> Result<u64> {
        let name = self.edge_collection(collection)?;
        self.expire_extant(name, timestamp, release_timestamp, version)
    }

    fn expire_extant(
        &self,
        collection: &str,
        timestamp: Timestamp,
        release_timestamp: Timestamp,
        version: &str,
    ) -> Result<u64> {
        let filter = Filter::ValidWithoutLastVersion {
            timestamp,
            version: version.to_string(),
        };
        self.backend
            .update_where(collection, &filter, &expire_patch(timestamp, release_timestamp))
    }

    /// Deletes every document created at `timestamp`. Rollback only.
    pub fn delete_created_documents(&self, collection: &str, timestamp: Timestamp) -> Result<u64> {
        let name = self.collection(collection)?;
        self.backend.remove_where(name, &Filter::CreatedAt(timestamp))
    }

    /// Makes every document expired at `timestamp` live again. Rollback only.
    pub fn undo_expire_documents(&self, collection: &str, timestamp: Timestamp) -> Result<u64> {
        let name = self.collection(collection)?;
        self.backend
            .update_where(name, &Filter::ExpiredAt(timestamp), &expire_patch(INF, INF))
    }

    /// Relabels every document whose `last_version` is `from`. Rollback only.
    pub fn reset_last_version(&self, collection: &str, from: &str, to: &str) -> Result<u64> {
        let name = self.collection(collection)?;
        self.backend.update_where(
            name,
            &Filter::LastVersion(from.to_string()),
            &Patch::new().set(fields::LAST_VERSION, to),
        )
    }

    /// Write buffer for the vertex collection (`None`) or an edge collection.
    pub fn batch_updater(&self, edge_collection: Option<&str>) -> Result<BatchUpdater> {
        match edge_collection {
            None => Ok(BatchUpdater::new(
                Arc::clone(&self.backend),
                &self.vertex_collection,
                CollectionKind::Vertex,
            )),
            Some(name) => {
                let name = self.edge_collection(Some(name))?;
                Ok(BatchUpdater::new(
                    Arc::clone(&self.backend),
                    name,
                    CollectionKind::Edge,
                ))
            }
        }
    }

    fn update_one(&self, collection: &str, key: &str, patch: &Patch) -> Result<()> {
        if self.backend.update(collection, key, patch)? {
            Ok(())
        } else {
            Err(GraphError::InvalidDocument(format!(
                "document {key} does not exist in {collection}"
            )))
        }
    }

    /// Resolves any bound collection by name.
    fn collection<'a>(&'a self, name: &'a str) -> Result<&'a str> {
        if name == self.vertex_collection {
            return Ok(&self.vertex_collection);
        }
        self.edge_collection(Some(name))
    }

    /// Resolves an edge collection; `None` is the default.
    fn edge_collection<'a>(&'a self, name: Option<&'a str>) -> Result<&'a str> {
        let Some(name) = name else {
            return self.default_edge_collection.as_deref().ok_or_else(|| {
                GraphError::configuration(
                    "no default edge collection specified, a collection name is required",
                )
            });
        };
        if self.merge_collection.as_deref() == Some(name)
            || self.edge_collections.iter().any(|c| c == name)
        {
            return Ok(name);
        }
        if name == self.vertex_collection {
            return Err(GraphError::configuration(format!(
                "{name} is a vertex collection"
            )));
        }
        Err(GraphError::UnknownCollection(name.to_string()))
    }
}

fn check_kind(backend: &dyn DocumentBackend, name: &str, kind: CollectionKind) -> Result<()> {
    match backend.collection_kind(name)? {
        Some(found) if found == kind => Ok(()),
        Some(_) => Err(GraphError::configuration(format!(
            "{name} is not {} collection",
            kind.describe()
        ))),
        None => Err(GraphError::configuration(format!(
            "collection {name} does not exist"
        ))),
    }
}

fn check_indexes(backend: &dyn DocumentBackend, name: &str) -> Result<()> {
    let present = backend.indexes(name)?;
    for spec in IndexSpec::required() {
        if !present.contains(&spec) {
            return Err(GraphError::configuration(format!(
                "collection {name} is missing required index with fields {spec}"
            )));
        }
    }
    Ok(())
}

/// Opens stores over a shared backend and registry.
///
/// Rollback learns the collections of a load from its registry entry and
/// needs a store bound to exactly those.
#[derive(Clone)]
pub struct StoreFactory {
    backend: Arc<dyn DocumentBackend>,
    registry_collection: String,
}

impl std::fmt::Debug for StoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFactory")
            .field("registry_collection", &self.registry_collection)
            .finish_non_exhaustive()
    }
}

impl StoreFactory {
    /// Creates a factory.
    pub fn new(backend: Arc<dyn DocumentBackend>, registry_collection: impl Into<String>) -> Self {
        Self {
            backend,
            registry_collection: registry_collection.into(),
        }
    }

    /// Opens the registry.
    pub fn registry(&self) -> Result<LoadRegistry> {
        LoadRegistry::open(Arc::clone(&self.backend), &self.registry_collection)
    }

    /// Opens a store over an explicit collection set with no default edge collection.
    pub fn open_store(
        &self,
        vertex_collection: &str,
        edge_collections: &[String],
        merge_collection: Option<&str>,
    ) -> Result<BitemporalStore> {
        let mut opts = StoreOptions::new(
            Arc::clone(&self.backend),
            self.registry_collection.clone(),
            vertex_collection,
        )
        .edge_collections(edge_collections.iter().cloned());
        if let Some(merge) = merge_collection {
            opts = opts.merge_collection(merge);
        }
        BitemporalStore::open(opts)
    }
}
