//! Per-collection write buffer.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::storage::DocumentBackend;
use crate::store::{new_edge_document, new_vertex_document, VersionStamp};
use crate::types::{doc_str, fields, CollectionKind, Document, Timestamp};

/// Collects creates, expiries and last-version stamps for one collection and
/// writes them with a single bulk upsert.
///
/// Obtain one from [`BitemporalStore::batch_updater`](crate::store::BitemporalStore::batch_updater).
/// Nothing touches the backend until [`flush`](Self::flush). Not shared
/// between threads; use one per chunk per collection.
pub struct BatchUpdater {
    backend: Arc<dyn DocumentBackend>,
    collection: String,
    kind: CollectionKind,
    pending: Vec<Document>,
}

impl std::fmt::Debug for BatchUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUpdater")
            .field("collection", &self.collection)
            .field("kind", &self.kind)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl BatchUpdater {
    pub(crate) fn new(
        backend: Arc<dyn DocumentBackend>,
        collection: &str,
        kind: CollectionKind,
    ) -> Self {
        Self {
            backend,
            collection: collection.to_string(),
            kind,
            pending: Vec::new(),
        }
    }

    /// Collection the updates apply to.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Kind of the target collection.
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Queues a new vertex version and returns its key.
    pub fn create_vertex(
        &mut self,
        id: &str,
        stamp: &VersionStamp,
        payload: &Document,
    ) -> Result<String> {
        self.ensure(CollectionKind::Vertex)?;
        let doc = new_vertex_document(&self.collection, id, stamp, payload);
        self.push_keyed(doc)
    }

    /// Queues a new edge version between two stored vertex versions and returns its key.
    pub fn create_edge(
        &mut self,
        id: &str,
        from_vertex: &Document,
        to_vertex: &Document,
        stamp: &VersionStamp,
        payload: Option<&Document>,
    ) -> Result<String> {
        self.ensure(CollectionKind::Edge)?;
        let doc = new_edge_document(&self.collection, id, from_vertex, to_vertex, stamp, payload)?;
        self.push_keyed(doc)
    }

    /// Queues a last-version stamp on a vertex version.
    pub fn set_last_version_on_vertex(&mut self, key: &str, version: &str) -> Result<()> {
        self.ensure(CollectionKind::Vertex)?;
        let mut update = Document::new();
        update.insert(fields::KEY.into(), key.into());
        update.insert(fields::LAST_VERSION.into(), version.into());
        self.pending.push(update);
        Ok(())
    }

    /// Queues a last-version stamp on a stored edge version.
    pub fn set_last_version_on_edge(&mut self, edge: &Document, version: &str) -> Result<()> {
        let mut update = Document::new();
        update.insert(fields::LAST_VERSION.into(), version.into());
        self.push_edge_update(edge, update)
    }

    /// Queues the expiry of a vertex version.
    pub fn expire_vertex(
        &mut self,
        key: &str,
        timestamp: Timestamp,
        release_timestamp: Timestamp,
    ) -> Result<()> {
        self.ensure(CollectionKind::Vertex)?;
        let mut update = Document::new();
        update.insert(fields::KEY.into(), key.into());
        update.insert(fields::EXPIRED.into(), timestamp.into());
        update.insert(fields::RELEASE_EXPIRED.into(), release_timestamp.into());
        self.pending.push(update);
        Ok(())
    }

    /// Queues the expiry of a stored edge version.
    pub fn expire_edge(
        &mut self,
        edge: &Document,
        timestamp: Timestamp,
        release_timestamp: Timestamp,
    ) -> Result<()> {
        let mut update = Document::new();
        update.insert(fields::EXPIRED.into(), timestamp.into());
        update.insert(fields::RELEASE_EXPIRED.into(), release_timestamp.into());
        self.push_edge_update(edge, update)
    }

    /// Number of queued updates.
    pub fn count(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every queued update without writing.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Writes the queued updates with one bulk upsert and clears the buffer.
    ///
    /// Returns the number of updates written. The buffer is emptied even when
    /// the write fails.
    pub fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let docs = std::mem::take(&mut self.pending);
        let written = docs.len();
        self.backend.import_bulk(&self.collection, docs)?;
        Ok(written)
    }

    // edge updates carry `_from`/`_to` so a bulk upsert never yields a dangling edge
    fn push_edge_update(&mut self, edge: &Document, mut update: Document) -> Result<()> {
        self.ensure(CollectionKind::Edge)?;
        for field in [fields::KEY, fields::FROM, fields::TO] {
            let value = doc_str(edge, field)?;
            update.insert(field.into(), Value::String(value.to_string()));
        }
        self.pending.push(update);
        Ok(())
    }

    fn push_keyed(&mut self, doc: Document) -> Result<String> {
        let key = doc_str(&doc, fields::KEY)?.to_string();
        self.pending.push(doc);
        Ok(key)
    }

    fn ensure(&self, wanted: CollectionKind) -> Result<()> {
        if self.kind == wanted {
            Ok(())
        } else {
            Err(GraphError::configuration(format!(
                "batch updater is configured for {} collection",
                self.kind.describe()
            )))
        }
    }
}
