#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use ttgraph::load::{load_graph_delta, DeltaLoadOptions, JsonLinesSource, NoMerges};
use ttgraph::storage::{DocumentBackend, SqliteBackend};
use ttgraph::store::{BitemporalStore, StoreFactory, StoreOptions};
use ttgraph::types::{CollectionKind, Document, IndexSpec, INF};
use ttgraph::{rollback_last_load, GraphError, Result};

fn options(backend: Arc<SqliteBackend>) -> StoreOptions {
    StoreOptions::new(backend, "registry", "taxa").default_edge_collection("child_of")
}

fn source(values: &[Value]) -> Vec<Result<Document>> {
    values
        .iter()
        .map(|v| Ok(v.as_object().cloned().expect("object")))
        .collect()
}

fn load(store: &BitemporalStore, version: &str, ts: i64, vertices: &[Value], edges: &[Value]) -> Result<()> {
    let opts = DeltaLoadOptions::new("taxonomy", version, ts, ts).batch_size(2);
    load_graph_delta(store, &opts, source(vertices), source(edges), None::<NoMerges>)?;
    Ok(())
}

fn write_lines(path: &Path, values: &[Value]) -> std::io::Result<()> {
    let text: String = values.iter().map(|v| format!("{v}\n")).collect();
    std::fs::write(path, text)
}

#[test]
fn created_collections_carry_the_required_indexes() -> Result<()> {
    let backend = Arc::new(SqliteBackend::open_in_memory()?);
    BitemporalStore::create(options(backend.clone()))?;
    for collection in ["taxa", "child_of"] {
        let indexes = backend.indexes(collection)?;
        for spec in IndexSpec::required() {
            assert!(indexes.contains(&spec), "{collection} lacks {spec}");
        }
    }
    Ok(())
}

#[test]
fn open_rejects_collections_without_indexes() -> Result<()> {
    let backend = Arc::new(SqliteBackend::open_in_memory()?);
    backend.create_collection("registry", CollectionKind::Vertex)?;
    backend.create_collection("taxa", CollectionKind::Vertex)?;
    backend.create_collection("child_of", CollectionKind::Edge)?;
    for spec in IndexSpec::required() {
        backend.ensure_index("taxa", &spec)?;
    }
    backend.ensure_index("child_of", &IndexSpec::id_expired_created())?;

    let err = BitemporalStore::open(options(backend.clone())).unwrap_err();
    match err {
        GraphError::Configuration(message) => {
            assert!(message.contains("child_of"), "{message}");
            assert!(message.contains("[expired, created, last_version]"), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }

    backend.ensure_index("child_of", &IndexSpec::expired_created_last_version())?;
    BitemporalStore::open(options(backend))?;
    Ok(())
}

#[test]
fn open_rejects_wrong_collection_kinds() -> Result<()> {
    let backend = Arc::new(SqliteBackend::open_in_memory()?);
    BitemporalStore::create(options(backend.clone()))?;
    let swapped = StoreOptions::new(backend, "registry", "child_of").default_edge_collection("taxa");
    assert!(matches!(
        BitemporalStore::open(swapped),
        Err(GraphError::Configuration(_))
    ));
    Ok(())
}

#[test]
fn loads_persist_across_reopen_and_roll_back() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("graph.db");
    let vertices = vec![
        json!({"id": "1", "name": "root"}),
        json!({"id": "2", "name": "Bacteria", "tags": {"gram": "negative"}}),
        json!({"id": "3", "name": "Archaea"}),
    ];
    let edges = vec![
        json!({"id": "2", "from": "2", "to": "1"}),
        json!({"id": "3", "from": "3", "to": "1"}),
    ];
    {
        let backend = Arc::new(SqliteBackend::open(&db)?);
        let store = BitemporalStore::create(options(backend))?;
        load(&store, "v1", 1_000, &vertices, &edges)?;
    }

    {
        let backend = Arc::new(SqliteBackend::open(&db)?);
        let store = BitemporalStore::open(options(backend))?;
        let found = store.get_vertices(&["2".to_string()], 1_500)?;
        let bacteria = &found["2"];
        assert_eq!(bacteria["_id"], json!("taxa/2_v1"));
        assert_eq!(bacteria["tags"], json!({"gram": "negative"}));
        assert_eq!(bacteria["expired"], json!(INF));

        load(&store, "v2", 2_000, &vertices[..2], &edges[..1])?;
        assert!(store.get_vertices(&["3".to_string()], 2_000)?.is_empty());
        assert_eq!(
            store.get_edges(&["3".to_string()], 2_000, None)?.len(),
            0
        );
    }

    let backend = Arc::new(SqliteBackend::open(&db)?);
    let report = rollback_last_load(&StoreFactory::new(backend.clone(), "registry"), "taxonomy")?;
    assert_eq!(report.rolled_back_version, "v2");
    assert_eq!(report.collections["taxa"].restored, 1);

    let store = BitemporalStore::open(options(backend))?;
    let vertices = store.get_vertices(&["3".to_string()], 2_000)?;
    let archaea = &vertices["3"];
    assert_eq!(archaea["expired"], json!(INF));
    assert_eq!(archaea["release_expired"], json!(INF));
    assert_eq!(archaea["last_version"], json!("v1"));
    let edges = store.get_edges(&["3".to_string()], 2_000, None)?;
    let edge = &edges["3"];
    assert_eq!(edge["_from"], json!("taxa/3_v1"));
    Ok(())
}

#[test]
fn json_lines_files_feed_a_load() -> Result<()> {
    let dir = TempDir::new()?;
    let vertices_path = dir.path().join("vertices.jsonl");
    let edges_path = dir.path().join("edges.jsonl");
    write_lines(
        &vertices_path,
        &[json!({"id": "a", "n": 1}), json!({"id": "b", "n": 2})],
    )?;
    write_lines(&edges_path, &[json!({"id": "ab", "from": "a", "to": "b"})])?;

    let backend = Arc::new(SqliteBackend::open(dir.path().join("graph.db"))?);
    let store = BitemporalStore::create(options(backend))?;
    let opts = DeltaLoadOptions::new("taxonomy", "v1", 10, 10);
    let report = load_graph_delta(
        &store,
        &opts,
        JsonLinesSource::open(&vertices_path)?,
        JsonLinesSource::open(&edges_path)?,
        None::<NoMerges>,
    )?;
    assert_eq!(report.vertices.created, 2);
    assert_eq!(report.edges["child_of"].created, 1);
    let edges = store.get_edges(&["ab".to_string()], 10, None)?;
    assert_eq!(edges["ab"]["_to"], json!("taxa/b_v1"));
    Ok(())
}

#[test]
fn repeated_ids_in_one_chunk_match_the_memory_backend() -> Result<()> {
    let backend = Arc::new(SqliteBackend::open_in_memory()?);
    let store = BitemporalStore::create(options(backend))?;
    load(&store, "v1", 100, &[json!({"id": "a", "n": 1}), json!({"id": "b"})], &[])?;

    let vertices = [json!({"id": "a", "n": 1}), json!({"id": "a", "n": 1}), json!({"id": "b"})];
    let opts = DeltaLoadOptions::new("taxonomy", "v2", 200, 200).batch_size(2);
    let report = load_graph_delta(&store, &opts, source(&vertices), source(&[]), None::<NoMerges>)?;
    assert_eq!(report.vertices.unchanged, 3);
    assert_eq!(report.vertices.deleted, 0);

    let found = store.get_vertices(&["a".to_string(), "a".to_string()], 200)?;
    assert_eq!(found.len(), 1);
    assert_eq!(found["a"]["last_version"], json!("v2"));
    Ok(())
}
