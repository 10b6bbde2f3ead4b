#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use ttgraph::load::{load_graph_delta, DeltaLoadOptions, LoadReport};
use ttgraph::registry::LoadState;
use ttgraph::storage::MemoryBackend;
use ttgraph::store::{BitemporalStore, StoreFactory, StoreOptions};
use ttgraph::types::{Document, Timestamp};
use ttgraph::{rollback_last_load, GraphError, Result};

const NAMESPACE: &str = "taxonomy";
const COLLECTIONS: [&str; 5] = ["registry", "taxa", "child_of", "synonym_of", "merged_into"];

struct Fixture {
    backend: Arc<MemoryBackend>,
    store: BitemporalStore,
    factory: StoreFactory,
}

impl Fixture {
    fn new() -> Result<Self> {
        let backend = Arc::new(MemoryBackend::new());
        let store = BitemporalStore::create(
            StoreOptions::new(backend.clone(), "registry", "taxa")
                .default_edge_collection("child_of")
                .edge_collections(["synonym_of"])
                .merge_collection("merged_into"),
        )?;
        let factory = StoreFactory::new(backend.clone(), "registry");
        Ok(Self {
            backend,
            store,
            factory,
        })
    }

    fn load(
        &self,
        version: &str,
        timestamp: Timestamp,
        vertices: &[Value],
        edges: &[Value],
        merges: &[Value],
    ) -> Result<LoadReport> {
        let opts = DeltaLoadOptions::new(NAMESPACE, version, timestamp, timestamp - 100).batch_size(2);
        load_graph_delta(
            &self.store,
            &opts,
            source(vertices),
            source(edges),
            Some(source(merges)),
        )
    }

    fn snapshot(&self) -> Result<BTreeMap<&'static str, Vec<Document>>> {
        COLLECTIONS
            .iter()
            .map(|c| Ok((*c, self.backend.dump(c)?)))
            .collect()
    }
}

fn source(values: &[Value]) -> Vec<Result<Document>> {
    values
        .iter()
        .map(|v| Ok(v.as_object().cloned().expect("object")))
        .collect()
}

fn first_release() -> (Vec<Value>, Vec<Value>) {
    (
        vec![
            json!({"id": "1", "name": "root"}),
            json!({"id": "2", "name": "Bacteria"}),
            json!({"id": "3", "name": "Archaea"}),
            json!({"id": "4", "name": "Proteobacteria"}),
        ],
        vec![
            json!({"id": "2", "from": "2", "to": "1"}),
            json!({"id": "3", "from": "3", "to": "1"}),
            json!({"id": "4", "from": "4", "to": "2"}),
            json!({"id": "s", "from": "4", "to": "3", "_collection": "synonym_of"}),
        ],
    )
}

/// Renames a vertex, drops one, adds one and merges another.
fn second_release() -> (Vec<Value>, Vec<Value>, Vec<Value>) {
    (
        vec![
            json!({"id": "1", "name": "root"}),
            json!({"id": "2", "name": "Bacteria"}),
            json!({"id": "4", "name": "Pseudomonadota"}),
            json!({"id": "5", "name": "Firmicutes"}),
        ],
        vec![
            json!({"id": "2", "from": "2", "to": "1"}),
            json!({"id": "4", "from": "4", "to": "2"}),
            json!({"id": "5", "from": "5", "to": "2"}),
        ],
        vec![json!({"id": "3", "from": "3", "to": "2"})],
    )
}

#[test]
fn rollback_restores_the_prior_state_exactly() -> Result<()> {
    let fx = Fixture::new()?;
    let (vertices, edges) = first_release();
    fx.load("v1", 1_000, &vertices, &edges, &[])?;
    let before = fx.snapshot()?;

    let (vertices, edges, merges) = second_release();
    let loaded = fx.load("v2", 2_000, &vertices, &edges, &merges)?;
    assert_eq!(loaded.merges_applied, 1);
    assert_ne!(fx.snapshot()?, before);

    let report = rollback_last_load(&fx.factory, NAMESPACE)?;
    assert_eq!(report.rolled_back_version, "v2");
    assert_eq!(report.restored_version, "v1");
    assert_eq!(fx.snapshot()?, before);

    let loads = fx.store.registry().get_registered_loads(NAMESPACE)?;
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].load_version, "v1");
    Ok(())
}

#[test]
fn rollback_reports_changes_per_collection() -> Result<()> {
    let fx = Fixture::new()?;
    let (vertices, edges) = first_release();
    fx.load("v1", 1_000, &vertices, &edges, &[])?;
    let (vertices, edges, merges) = second_release();
    fx.load("v2", 2_000, &vertices, &edges, &merges)?;

    let report = rollback_last_load(&fx.factory, NAMESPACE)?;
    assert_eq!(
        report.collections.keys().collect::<Vec<_>>(),
        vec!["child_of", "merged_into", "synonym_of", "taxa"]
    );
    // 4_v2 and 5_v2 created; 3_v1 (merged) and 4_v1 (renamed) expired
    let taxa = &report.collections["taxa"];
    assert_eq!(taxa.deleted, 2);
    assert_eq!(taxa.restored, 2);
    assert_eq!(taxa.relabelled, 2);
    // 4_v2 and 5_v2 created; 3_v1 swept and 4_v1 repointed
    let child_of = &report.collections["child_of"];
    assert_eq!(child_of.deleted, 2);
    assert_eq!(child_of.restored, 2);
    assert_eq!(child_of.relabelled, 1);
    let synonym_of = &report.collections["synonym_of"];
    assert_eq!(synonym_of.deleted, 0);
    assert_eq!(synonym_of.restored, 1);
    assert_eq!(report.collections["merged_into"].deleted, 1);
    Ok(())
}

#[test]
fn a_single_load_cannot_be_rolled_back() -> Result<()> {
    let fx = Fixture::new()?;
    let (vertices, edges) = first_release();
    fx.load("v1", 1_000, &vertices, &edges, &[])?;
    let before = fx.snapshot()?;

    let err = rollback_last_load(&fx.factory, NAMESPACE).unwrap_err();
    assert!(matches!(
        err,
        GraphError::NothingToRollBack { registered: 1, .. }
    ));
    assert_eq!(fx.snapshot()?, before);
    let entry = fx
        .store
        .registry()
        .get_registered_load(NAMESPACE, "v1")?
        .expect("still registered");
    assert_eq!(entry.state, LoadState::Complete);

    let err = rollback_last_load(&fx.factory, "never_loaded").unwrap_err();
    assert!(matches!(
        err,
        GraphError::NothingToRollBack { registered: 0, .. }
    ));
    Ok(())
}

#[test]
fn failed_load_can_be_rolled_back_and_retried() -> Result<()> {
    let fx = Fixture::new()?;
    let (vertices, edges) = first_release();
    fx.load("v1", 1_000, &vertices, &edges, &[])?;
    let before = fx.snapshot()?;

    let (new_vertices, mut new_edges, merges) = second_release();
    new_edges.push(json!({"id": "9", "from": "9", "to": "1"}));
    let err = fx
        .load("v2", 2_000, &new_vertices, &new_edges, &merges)
        .unwrap_err();
    assert!(matches!(err, GraphError::MissingEndpoint { .. }));
    let pending = fx
        .store
        .registry()
        .get_registered_load(NAMESPACE, "v2")?
        .expect("registered");
    assert_eq!(pending.state, LoadState::InProgress);

    rollback_last_load(&fx.factory, NAMESPACE)?;
    assert_eq!(fx.snapshot()?, before);

    new_edges.pop();
    let report = fx.load("v2", 2_000, &new_vertices, &new_edges, &merges)?;
    assert_eq!(report.vertices.created, 1);
    assert_eq!(report.vertices.updated, 1);
    Ok(())
}

#[test]
fn consecutive_rollbacks_walk_back_one_load_each() -> Result<()> {
    let fx = Fixture::new()?;
    let (vertices, edges) = first_release();
    fx.load("v1", 1_000, &vertices, &edges, &[])?;
    let after_v1 = fx.snapshot()?;
    let (v2_vertices, v2_edges, merges) = second_release();
    fx.load("v2", 2_000, &v2_vertices, &v2_edges, &merges)?;
    let after_v2 = fx.snapshot()?;
    fx.load("v3", 3_000, &v2_vertices[..2], &v2_edges[..1], &[])?;

    assert_eq!(rollback_last_load(&fx.factory, NAMESPACE)?.restored_version, "v2");
    assert_eq!(fx.snapshot()?, after_v2);
    assert_eq!(rollback_last_load(&fx.factory, NAMESPACE)?.restored_version, "v1");
    assert_eq!(fx.snapshot()?, after_v1);
    assert!(rollback_last_load(&fx.factory, NAMESPACE).is_err());
    Ok(())
}
