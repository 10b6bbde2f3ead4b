#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

const CONFIG: &str = r#"
[store]
path = "graph.db"
vertex_collection = "taxa"
default_edge_collection = "child_of"
merge_collection = "merged_into"

[load]
namespace = "taxonomy"
batch_size = 2
"#;

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = dir.path().join("ttgraph.toml");
        fs::write(&config, CONFIG).expect("write config");
        Self { dir, config }
    }

    fn write_lines(&self, name: &str, values: &[Value]) -> PathBuf {
        let path = self.dir.path().join(name);
        let text: String = values.iter().map(|v| format!("{v}\n")).collect();
        fs::write(&path, text).expect("write json lines");
        path
    }

    fn run(&self, args: &[&str]) -> String {
        let output = cargo_bin_cmd!("ttgraph")
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        String::from_utf8(output).expect("utf8 stdout")
    }

    fn fail(&self, args: &[&str]) -> String {
        let output = cargo_bin_cmd!("ttgraph")
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .assert()
            .failure()
            .code(1)
            .get_output()
            .stderr
            .clone();
        String::from_utf8(output).expect("utf8 stderr")
    }

    fn load(&self, version: &str, timestamp: &str, vertices: &Path, edges: &Path) -> String {
        self.run(&[
            "load",
            "--version",
            version,
            "--timestamp",
            timestamp,
            "--release-timestamp",
            timestamp,
            "--vertices",
            path_str(vertices),
            "--edges",
            path_str(edges),
        ])
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf8 path")
}

fn seeded() -> Workspace {
    let ws = Workspace::new();
    let out = ws.run(&["init"]);
    assert!(out.starts_with("Initialized "), "{out}");
    assert!(ws.dir.path().join("graph.db").exists());

    let v1 = ws.write_lines(
        "v1_vertices.jsonl",
        &[
            json!({"id": "1", "name": "root"}),
            json!({"id": "2", "name": "Bacteria"}),
            json!({"id": "3", "name": "Archaea"}),
        ],
    );
    let edges = ws.write_lines(
        "v1_edges.jsonl",
        &[
            json!({"id": "2", "from": "2", "to": "1"}),
            json!({"id": "3", "from": "3", "to": "1"}),
        ],
    );
    let out = ws.load("v1", "1000", &v1, &edges);
    assert!(out.contains("Loaded taxonomy version v1"), "{out}");
    assert!(out.contains("vertices: created=3"), "{out}");
    ws
}

fn load_second(ws: &Workspace) -> String {
    let v2 = ws.write_lines(
        "v2_vertices.jsonl",
        &[
            json!({"id": "1", "name": "root"}),
            json!({"id": "2", "name": "Bacteria", "rank": "superkingdom"}),
        ],
    );
    let edges = ws.write_lines("v2_edges.jsonl", &[json!({"id": "2", "from": "2", "to": "1"})]);
    ws.load("v2", "2000", &v2, &edges)
}

#[test]
fn load_list_get_and_rollback() {
    let ws = seeded();
    let out = load_second(&ws);
    // the sweep also re-closes the versions replaced by this load
    assert!(out.contains("vertices: created=0 updated=1 unchanged=1 deleted=2"), "{out}");
    assert!(out.contains("child_of: created=0 updated=1 unchanged=0 deleted=2"), "{out}");

    let out = ws.run(&["loads"]);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines, vec!["v2\t2000\t2000\tcomplete", "v1\t1000\t1000\tcomplete"]);

    let out = ws.run(&["get", "--timestamp", "1500", "3"]);
    let archaea: Value = serde_json::from_str(out.trim()).expect("json line");
    assert_eq!(archaea["_key"], "3_v1");
    let out = ws.run(&["get", "--timestamp", "2000", "3", "2"]);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "3: not found");
    let bacteria: Value = serde_json::from_str(lines[1]).expect("json line");
    assert_eq!(bacteria["rank"], "superkingdom");

    let out = ws.run(&["rollback"]);
    assert!(out.starts_with("Rolled back taxonomy version v2; v1 is current again"), "{out}");
    let out = ws.run(&["get", "--timestamp", "2000", "3"]);
    let archaea: Value = serde_json::from_str(out.trim()).expect("json line");
    assert_eq!(archaea["last_version"], "v1");
}

#[test]
fn json_format_emits_reports() {
    let ws = seeded();
    let out = ws.run(&["--format", "json", "loads"]);
    let loads: Value = serde_json::from_str(&out).expect("json");
    assert_eq!(loads[0]["load_version"], "v1");
    assert_eq!(loads[0]["state"], "complete");
    assert_eq!(loads[0]["vertex_collection"], "taxa");

    let out = ws.run(&["--format", "json", "get", "--timestamp", "1000", "--edges", "child_of", "2"]);
    let edges: Value = serde_json::from_str(&out).expect("json");
    assert_eq!(edges["2"]["_from"], "taxa/2_v1");
    assert_eq!(edges["2"]["_to"], "taxa/1_v1");

    load_second(&ws);
    let out = ws.run(&["--format", "json", "rollback"]);
    let report: Value = serde_json::from_str(&out).expect("json");
    assert_eq!(report["rolled_back_version"], "v2");
    assert_eq!(report["collections"]["taxa"]["restored"], 2);
}

#[test]
fn errors_are_reported_on_stderr() {
    let ws = seeded();
    let err = ws.fail(&["rollback"]);
    assert!(err.contains("error:"), "{err}");
    assert!(err.contains("taxonomy"), "{err}");

    let vertices = ws.write_lines("again.jsonl", &[json!({"id": "1"})]);
    let edges = ws.write_lines("none.jsonl", &[]);
    let err = ws.fail(&[
        "load",
        "--version",
        "v1",
        "--timestamp",
        "3000",
        "--release-timestamp",
        "3000",
        "--vertices",
        path_str(&vertices),
        "--edges",
        path_str(&edges),
    ]);
    assert!(err.contains("error:"), "{err}");
    assert!(err.contains("v1"), "{err}");
}

#[test]
fn missing_config_fails() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("ttgraph")
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("loads")
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let err = String::from_utf8(output).expect("utf8 stderr");
    assert!(err.contains("error: failed to read config"), "{err}");
}
