use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Processing pass of a delta load.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPass {
    /// Vertex diff pass.
    Vertices,
    /// Merge pass.
    Merges,
    /// Edge diff pass.
    Edges,
}

impl LoadPass {
    /// Short label used in logs and progress output.
    pub fn as_str(self) -> &'static str {
        match self {
            LoadPass::Vertices => "vertices",
            LoadPass::Merges => "merges",
            LoadPass::Edges => "edges",
        }
    }
}

/// Hooks invoked as a delta load makes progress.
///
/// Implementations must be cheap; they run on the loading thread after every
/// chunk.
pub trait LoadMetrics: Send + Sync {
    /// A chunk of `documents` incoming entities was flushed with `writes` bulk updates.
    fn chunk_flushed(&self, pass: LoadPass, documents: usize, writes: usize);

    /// A deletion sweep over `collection` expired `expired` documents.
    fn sweep_completed(&self, collection: &str, expired: u64);
}

/// Discards every event.
#[derive(Default)]
pub struct NoopMetrics;

impl LoadMetrics for NoopMetrics {
    fn chunk_flushed(&self, _pass: LoadPass, _documents: usize, _writes: usize) {}
    fn sweep_completed(&self, _collection: &str, _expired: u64) {}
}

/// Thread-safe counters over load events.
#[derive(Default)]
pub struct CounterMetrics {
    /// Vertex chunks flushed.
    pub vertex_chunks: AtomicU64,
    /// Incoming vertices processed.
    pub vertices: AtomicU64,
    /// Merge chunks flushed.
    pub merge_chunks: AtomicU64,
    /// Incoming merges processed.
    pub merges: AtomicU64,
    /// Edge chunks flushed, counted once per target collection.
    pub edge_chunks: AtomicU64,
    /// Incoming edges processed.
    pub edges: AtomicU64,
    /// Bulk updates written across all passes.
    pub writes: AtomicU64,
    /// Sweeps run.
    pub sweeps: AtomicU64,
    /// Documents expired by sweeps.
    pub swept: AtomicU64,
}

impl LoadMetrics for CounterMetrics {
    fn chunk_flushed(&self, pass: LoadPass, documents: usize, writes: usize) {
        let (chunks, docs) = match pass {
            LoadPass::Vertices => (&self.vertex_chunks, &self.vertices),
            LoadPass::Merges => (&self.merge_chunks, &self.merges),
            LoadPass::Edges => (&self.edge_chunks, &self.edges),
        };
        chunks.fetch_add(1, Ordering::Relaxed);
        docs.fetch_add(documents as u64, Ordering::Relaxed);
        self.writes.fetch_add(writes as u64, Ordering::Relaxed);
    }

    fn sweep_completed(&self, _collection: &str, expired: u64) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.swept.fetch_add(expired, Ordering::Relaxed);
    }
}

impl CounterMetrics {
    /// Reads a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
