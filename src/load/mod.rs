#![forbid(unsafe_code)]

//! Delta loading of full graph snapshots.
//!
//! [`load_graph_delta`] compares a new snapshot against what is live at the
//! load timestamp and writes only the difference: new versions for new or
//! changed entities, expiries for entities that disappeared, and a
//! `last_version` stamp for everything that survived untouched.
//!
//! While a load runs, queries at or after its timestamp are not reproducible.

mod metrics;
mod source;

pub use metrics::{CounterMetrics, LoadMetrics, LoadPass, NoopMetrics};
pub use source::{from_documents, Chunks, JsonLinesSource};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::registry::now_millis;
use crate::store::{BitemporalStore, VersionStamp};
use crate::types::{doc_str, fields, payload_equal, Document, Timestamp, INF};

/// Default number of entities per chunk.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Merge source type for loads without merges: `None::<NoMerges>`.
pub type NoMerges = std::iter::Empty<Result<Document>>;

/// Parameters of one delta load.
#[derive(Clone)]
pub struct DeltaLoadOptions {
    /// Registry namespace of the data set.
    pub namespace: String,
    /// Version label of this load, unique within the namespace.
    pub version: String,
    /// System time at which the load becomes active.
    pub timestamp: Timestamp,
    /// Release time of the source data.
    pub release_timestamp: Timestamp,
    /// Entities per chunk.
    pub batch_size: usize,
    /// Progress hooks.
    pub metrics: Arc<dyn LoadMetrics>,
}

impl std::fmt::Debug for DeltaLoadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaLoadOptions")
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("timestamp", &self.timestamp)
            .field("release_timestamp", &self.release_timestamp)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl DeltaLoadOptions {
    /// Options with the default batch size and no metrics.
    pub fn new(
        namespace: impl Into<String>,
        version: impl Into<String>,
        timestamp: Timestamp,
        release_timestamp: Timestamp,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            version: version.into(),
            timestamp,
            release_timestamp,
            batch_size: DEFAULT_BATCH_SIZE,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Sets the chunk size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Installs progress hooks.
    pub fn metrics(mut self, metrics: Arc<dyn LoadMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn stamp(&self) -> VersionStamp {
        VersionStamp::new(self.version.clone(), self.timestamp, self.release_timestamp)
    }
}

/// Per-collection outcome of a diff pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PassCounts {
    /// Entities with no live version that got their first one.
    pub created: u64,
    /// Entities whose live version was expired and replaced.
    pub updated: u64,
    /// Entities whose live version only had `last_version` advanced.
    pub unchanged: u64,
    /// Rows expired by the deletion sweep. Versions this load already
    /// expired at the sweep time are counted again.
    pub deleted: u64,
}

/// Summary of a completed delta load.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LoadReport {
    /// Registry namespace.
    pub namespace: String,
    /// Loaded version.
    pub version: String,
    /// System time of the load.
    pub load_timestamp: Timestamp,
    /// Release time of the load.
    pub release_timestamp: Timestamp,
    /// Vertex pass and sweep.
    pub vertices: PassCounts,
    /// Merges that expired a vertex and produced a merge edge.
    pub merges_applied: u64,
    /// Merges skipped because an endpoint did not exist.
    pub merges_skipped: u64,
    /// Edge pass and sweep per edge collection.
    pub edges: BTreeMap<String, PassCounts>,
    /// Chunks flushed across all passes.
    pub chunks: u64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

/// Loads a full snapshot as a new version of a namespace.
///
/// Sources are consumed once, front to back, in chunks of
/// [`DeltaLoadOptions::batch_size`]. Vertices are processed first, then merges,
/// then edges, so edge endpoints always resolve to the vertex versions this
/// load just wrote.
///
/// Counts are per source record. An id repeated within a source resolves to
/// the same stored version each time and is counted once per occurrence; its
/// writes collapse onto one version key.
///
/// Any error aborts the load and leaves its registry entry `in_progress`; the
/// namespace must then be rolled back with
/// [`rollback_last_load`](crate::rollback::rollback_last_load) before retrying.
pub fn load_graph_delta<V, E, M>(
    store: &BitemporalStore,
    opts: &DeltaLoadOptions,
    vertices: V,
    edges: E,
    merges: Option<M>,
) -> Result<LoadReport>
where
    V: IntoIterator<Item = Result<Document>>,
    E: IntoIterator<Item = Result<Document>>,
    M: IntoIterator<Item = Result<Document>>,
{
    if opts.batch_size == 0 {
        return Err(GraphError::configuration("batch size must be positive"));
    }
    for (name, ts) in [("timestamp", opts.timestamp), ("release timestamp", opts.release_timestamp)] {
        if ts <= 0 || ts >= INF {
            return Err(GraphError::configuration(format!(
                "{name} {ts} is outside (0, {INF})"
            )));
        }
    }
    if merges.is_some() && store.merge_collection().is_none() {
        return Err(GraphError::configuration(
            "a merge source was supplied but the store has no merge collection",
        ));
    }

    let started = Instant::now();
    let registry = store.registry();
    registry.register_load_start(
        &opts.namespace,
        &opts.version,
        opts.timestamp,
        opts.release_timestamp,
        now_millis(),
        &store.load_collections(),
    )?;
    info!(
        namespace = %opts.namespace,
        version = %opts.version,
        timestamp = opts.timestamp,
        release_timestamp = opts.release_timestamp,
        batch_size = opts.batch_size,
        "load.start"
    );

    let mut loader = DeltaLoader {
        store,
        opts,
        stamp: opts.stamp(),
        report: LoadReport {
            namespace: opts.namespace.clone(),
            version: opts.version.clone(),
            load_timestamp: opts.timestamp,
            release_timestamp: opts.release_timestamp,
            ..LoadReport::default()
        },
    };

    for chunk in Chunks::new(vertices.into_iter(), opts.batch_size) {
        loader.vertex_chunk(&chunk?)?;
    }
    if let Some(merges) = merges {
        for chunk in Chunks::new(merges.into_iter(), opts.batch_size) {
            loader.merge_chunk(&chunk?)?;
        }
    }
    loader.sweep_vertices()?;
    for chunk in Chunks::new(edges.into_iter(), opts.batch_size) {
        loader.edge_chunk(chunk?)?;
    }
    loader.sweep_edges()?;

    registry.register_load_complete(&opts.namespace, &opts.version, now_millis())?;
    let mut report = loader.report;
    report.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(
        namespace = %report.namespace,
        version = %report.version,
        vertices_created = report.vertices.created,
        vertices_updated = report.vertices.updated,
        vertices_deleted = report.vertices.deleted,
        merges_applied = report.merges_applied,
        chunks = report.chunks,
        duration_ms = report.duration_ms,
        "load.complete"
    );
    Ok(report)
}

struct DeltaLoader<'a> {
    store: &'a BitemporalStore,
    opts: &'a DeltaLoadOptions,
    stamp: VersionStamp,
    report: LoadReport,
}

impl DeltaLoader<'_> {
    /// One tick before the load; the end of every interval this load closes.
    fn before(&self) -> (Timestamp, Timestamp) {
        (self.opts.timestamp - 1, self.opts.release_timestamp - 1)
    }

    fn vertex_chunk(&mut self, chunk: &[Document]) -> Result<()> {
        let ids = chunk
            .iter()
            .map(|v| doc_str(v, fields::ID).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        let existing = self.store.get_vertices(&ids, self.opts.timestamp)?;
        let (expire_at, release_expire_at) = self.before();
        let mut updater = self.store.batch_updater(None)?;
        let counts = &mut self.report.vertices;
        for (id, vertex) in ids.iter().zip(chunk) {
            match existing.get(id) {
                None => {
                    updater.create_vertex(id, &self.stamp, vertex)?;
                    counts.created += 1;
                }
                Some(stored) if !payload_equal(vertex, stored) => {
                    updater.expire_vertex(doc_str(stored, fields::KEY)?, expire_at, release_expire_at)?;
                    updater.create_vertex(id, &self.stamp, vertex)?;
                    counts.updated += 1;
                }
                Some(stored) => {
                    updater.set_last_version_on_vertex(doc_str(stored, fields::KEY)?, &self.opts.version)?;
                    counts.unchanged += 1;
                }
            }
        }
        let writes = updater.flush()?;
        self.chunk_done(LoadPass::Vertices, chunk.len(), writes);
        debug!(documents = chunk.len(), writes, "load.vertices.chunk");
        Ok(())
    }

    fn merge_chunk(&mut self, chunk: &[Document]) -> Result<()> {
        let merge_collection = self
            .store
            .merge_collection()
            .ok_or_else(|| GraphError::configuration("no merge collection configured"))?;
        let mut vertex_ids = BTreeSet::new();
        for merge in chunk {
            doc_str(merge, fields::ID)?;
            vertex_ids.insert(doc_str(merge, fields::FROM_ID)?.to_string());
            vertex_ids.insert(doc_str(merge, fields::TO_ID)?.to_string());
        }
        let vertex_ids: Vec<String> = vertex_ids.into_iter().collect();
        let current = self.store.get_vertices(&vertex_ids, self.opts.timestamp)?;

        let (expire_at, release_expire_at) = self.before();
        let mut vertex_updater = self.store.batch_updater(None)?;
        let mut merge_updater = self.store.batch_updater(Some(merge_collection))?;
        for merge in chunk {
            let merged = current.get(doc_str(merge, fields::FROM_ID)?);
            let target = current.get(doc_str(merge, fields::TO_ID)?);
            // merges against vertices that no longer exist are not resolved
            let (Some(merged), Some(target)) = (merged, target) else {
                self.report.merges_skipped += 1;
                continue;
            };
            vertex_updater.expire_vertex(doc_str(merged, fields::KEY)?, expire_at, release_expire_at)?;
            merge_updater.create_edge(
                doc_str(merge, fields::ID)?,
                merged,
                target,
                &self.stamp,
                Some(merge),
            )?;
            self.report.merges_applied += 1;
        }
        let writes = vertex_updater.flush()? + merge_updater.flush()?;
        self.chunk_done(LoadPass::Merges, chunk.len(), writes);
        debug!(documents = chunk.len(), writes, "load.merges.chunk");
        Ok(())
    }

    fn sweep_vertices(&mut self) -> Result<()> {
        let (expire_at, release_expire_at) = self.before();
        let expired = self.store.expire_extant_vertices_without_last_version(
            expire_at,
            release_expire_at,
            &self.opts.version,
        )?;
        self.report.vertices.deleted = expired;
        self.opts
            .metrics
            .sweep_completed(self.store.vertex_collection(), expired);
        info!(
            collection = self.store.vertex_collection(),
            expired, "load.vertices.sweep"
        );
        Ok(())
    }

    fn edge_chunk(&mut self, chunk: Vec<Document>) -> Result<()> {
        let mut by_collection: BTreeMap<String, Vec<Document>> = BTreeMap::new();
        for edge in chunk {
            let collection = self.target_collection(&edge)?;
            by_collection.entry(collection).or_default().push(edge);
        }
        for (collection, edges) in by_collection {
            self.edge_group(&collection, &edges)?;
        }
        Ok(())
    }

    fn target_collection(&self, edge: &Document) -> Result<String> {
        match edge.get(fields::COLLECTION) {
            None | Some(Value::Null) => self
                .store
                .default_edge_collection()
                .map(str::to_string)
                .ok_or_else(|| {
                    GraphError::configuration(
                        "edge has no _collection and the store has no default edge collection",
                    )
                }),
            Some(Value::String(name)) => {
                if self.store.edge_collections().iter().any(|c| c == name) {
                    Ok(name.clone())
                } else {
                    Err(GraphError::UnknownCollection(name.clone()))
                }
            }
            Some(other) => Err(GraphError::InvalidDocument(format!(
                "'_collection' must be a string, found {other}"
            ))),
        }
    }

    fn edge_group(&mut self, collection: &str, edges: &[Document]) -> Result<()> {
        let mut edge_ids = Vec::with_capacity(edges.len());
        let mut vertex_ids = BTreeSet::new();
        for edge in edges {
            edge_ids.push(doc_str(edge, fields::ID)?.to_string());
            vertex_ids.insert(doc_str(edge, fields::FROM_ID)?.to_string());
            vertex_ids.insert(doc_str(edge, fields::TO_ID)?.to_string());
        }
        let vertex_ids: Vec<String> = vertex_ids.into_iter().collect();
        let existing = self
            .store
            .get_edges(&edge_ids, self.opts.timestamp, Some(collection))?;
        let vertices = self.store.get_vertices(&vertex_ids, self.opts.timestamp)?;

        let (expire_at, release_expire_at) = self.before();
        let mut updater = self.store.batch_updater(Some(collection))?;
        let mut counts = PassCounts::default();
        for (id, edge) in edge_ids.iter().zip(edges) {
            let from = endpoint(&vertices, id, doc_str(edge, fields::FROM_ID)?)?;
            let to = endpoint(&vertices, id, doc_str(edge, fields::TO_ID)?)?;
            match existing.get(id) {
                None => {
                    updater.create_edge(id, from, to, &self.stamp, Some(edge))?;
                    counts.created += 1;
                }
                Some(stored) if edge_changed(edge, stored, from, to) => {
                    updater.expire_edge(stored, expire_at, release_expire_at)?;
                    updater.create_edge(id, from, to, &self.stamp, Some(edge))?;
                    counts.updated += 1;
                }
                Some(stored) => {
                    updater.set_last_version_on_edge(stored, &self.opts.version)?;
                    counts.unchanged += 1;
                }
            }
        }
        let writes = updater.flush()?;
        let total = self.report.edges.entry(collection.to_string()).or_default();
        total.created += counts.created;
        total.updated += counts.updated;
        total.unchanged += counts.unchanged;
        self.chunk_done(LoadPass::Edges, edges.len(), writes);
        debug!(collection, documents = edges.len(), writes, "load.edges.chunk");
        Ok(())
    }

    fn sweep_edges(&mut self) -> Result<()> {
        let (expire_at, release_expire_at) = self.before();
        for collection in self.store.edge_collections() {
            let expired = self.store.expire_extant_edges_without_last_version(
                expire_at,
                release_expire_at,
                &self.opts.version,
                Some(collection),
            )?;
            self.report
                .edges
                .entry(collection.clone())
                .or_default()
                .deleted = expired;
            self.opts.metrics.sweep_completed(collection, expired);
            info!(collection = %collection, expired, "load.edges.sweep");
        }
        Ok(())
    }

    fn chunk_done(&mut self, pass: LoadPass, documents: usize, writes: usize) {
        self.report.chunks += 1;
        self.opts.metrics.chunk_flushed(pass, documents, writes);
    }
}

fn endpoint<'v>(
    vertices: &'v FxHashMap<String, Document>,
    edge: &str,
    vertex: &str,
) -> Result<&'v Document> {
    vertices.get(vertex).ok_or_else(|| GraphError::MissingEndpoint {
        edge: edge.to_string(),
        vertex: vertex.to_string(),
    })
}

/// An edge changes when its payload does or when either endpoint now resolves
/// to a different vertex version.
fn edge_changed(incoming: &Document, stored: &Document, from: &Document, to: &Document) -> bool {
    !payload_equal(incoming, stored)
        || stored.get(fields::FROM) != from.get(fields::FULL_ID)
        || stored.get(fields::TO) != to.get(fields::FULL_ID)
}
