//! Command line front end for delta loads, rollbacks and point-in-time lookups.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use ttgraph::config::LoaderConfig;
use ttgraph::load::{load_graph_delta, DeltaLoadOptions, JsonLinesSource, LoadMetrics, LoadPass};
use ttgraph::registry::RegistryEntry;
use ttgraph::storage::SqliteBackend;
use ttgraph::store::BitemporalStore;
use ttgraph::{rollback_last_load, Document, LoadReport, RollbackReport, Timestamp};

#[derive(Parser, Debug)]
#[command(
    name = "ttgraph",
    version,
    about = "Delta loader for bitemporal graph stores",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "TTGRAPH_CONFIG",
        value_name = "FILE",
        default_value = "ttgraph.toml",
        help = "Loader configuration file"
    )]
    config: PathBuf,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create the configured collections and their indexes")]
    Init,

    #[command(about = "Load a full snapshot as a new version")]
    Load(LoadCmd),

    #[command(about = "Roll back the most recent load of a namespace")]
    Rollback {
        #[arg(long, help = "Namespace to roll back (defaults to load.namespace)")]
        namespace: Option<String>,
    },

    #[command(about = "List the registered loads of a namespace")]
    Loads {
        #[arg(long, help = "Namespace to list (defaults to load.namespace)")]
        namespace: Option<String>,
    },

    #[command(about = "Fetch vertices or edges as they existed at a timestamp")]
    Get {
        #[arg(long, help = "System time in Unix epoch milliseconds")]
        timestamp: Timestamp,

        #[arg(long, value_name = "COLLECTION", help = "Query this edge collection instead of vertices")]
        edges: Option<String>,

        #[arg(required = true, value_name = "ID", help = "External ids to fetch")]
        ids: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct LoadCmd {
    #[arg(long = "version", value_name = "VERSION", help = "Version label of this load")]
    load_version: String,

    #[arg(long, help = "System time at which the load becomes active (epoch ms)")]
    timestamp: Timestamp,

    #[arg(long, help = "Release time of the source data (epoch ms)")]
    release_timestamp: Timestamp,

    #[arg(long, value_name = "FILE", help = "JSON-lines file of vertices")]
    vertices: PathBuf,

    #[arg(long, value_name = "FILE", help = "JSON-lines file of edges")]
    edges: PathBuf,

    #[arg(long, value_name = "FILE", help = "JSON-lines file of merges")]
    merges: Option<PathBuf>,

    #[arg(long, help = "Namespace override")]
    namespace: Option<String>,

    #[arg(long, help = "Entities per chunk override")]
    batch_size: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct InitSummary {
    path: String,
    registry_collection: String,
    vertex_collection: String,
    edge_collections: Vec<String>,
    merge_collection: Option<String>,
}

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ttgraph=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = LoaderConfig::load(&cli.config)?;
    let backend = Arc::new(SqliteBackend::open(&config.store.path)?);

    match cli.command {
        Command::Init => {
            let store = BitemporalStore::create(config.store_options(backend))?;
            let summary = InitSummary {
                path: config.store.path.display().to_string(),
                registry_collection: store.registry().collection().to_string(),
                vertex_collection: store.vertex_collection().to_string(),
                edge_collections: store.edge_collections().to_vec(),
                merge_collection: store.merge_collection().map(str::to_string),
            };
            emit(cli.format, &summary, || print_init_text(&summary))?;
        }
        Command::Load(cmd) => {
            let namespace = config.namespace(cmd.namespace.as_deref())?;
            let store = BitemporalStore::open(config.store_options(backend))?;
            let progress = Arc::new(ProgressMetrics::new(cli.format == OutputFormat::Text));
            let opts = DeltaLoadOptions::new(
                namespace,
                cmd.load_version,
                cmd.timestamp,
                cmd.release_timestamp,
            )
            .batch_size(cmd.batch_size.unwrap_or(config.load.batch_size))
            .metrics(progress.clone());
            let vertices = JsonLinesSource::open(&cmd.vertices)?;
            let edges = JsonLinesSource::open(&cmd.edges)?;
            let merges = cmd.merges.as_ref().map(JsonLinesSource::open).transpose()?;
            let result = load_graph_delta(&store, &opts, vertices, edges, merges);
            progress.finish();
            let report = result?;
            emit(cli.format, &report, || print_load_text(&report))?;
        }
        Command::Rollback { namespace } => {
            let namespace = config.namespace(namespace.as_deref())?;
            let report = rollback_last_load(&config.store_factory(backend), &namespace)?;
            emit(cli.format, &report, || print_rollback_text(&report))?;
        }
        Command::Loads { namespace } => {
            let namespace = config.namespace(namespace.as_deref())?;
            let loads = config
                .store_factory(backend)
                .registry()?
                .get_registered_loads(&namespace)?;
            emit(cli.format, &loads, || print_loads_text(&namespace, &loads))?;
        }
        Command::Get {
            timestamp,
            edges,
            ids,
        } => {
            let store = BitemporalStore::open(config.store_options(backend))?;
            let found = match edges.as_deref() {
                Some(collection) => store.get_edges(&ids, timestamp, Some(collection))?,
                None => store.get_vertices(&ids, timestamp)?,
            };
            let found: BTreeMap<String, Document> = found.into_iter().collect();
            emit(cli.format, &found, || print_documents_text(&ids, &found))?;
        }
    }

    Ok(())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_init_text(summary: &InitSummary) {
    println!("Initialized {}", summary.path);
    println!("  registry: {}", summary.registry_collection);
    println!("  vertices: {}", summary.vertex_collection);
    println!("  edges:    {}", summary.edge_collections.join(", "));
    if let Some(merge) = &summary.merge_collection {
        println!("  merges:   {merge}");
    }
}

fn print_load_text(report: &LoadReport) {
    println!(
        "Loaded {} version {} at {} in {:.2} ms ({} chunks)",
        report.namespace, report.version, report.load_timestamp, report.duration_ms, report.chunks
    );
    let v = &report.vertices;
    println!(
        "  vertices: created={} updated={} unchanged={} deleted={}",
        v.created, v.updated, v.unchanged, v.deleted
    );
    if report.merges_applied + report.merges_skipped > 0 {
        println!(
            "  merges:   applied={} skipped={}",
            report.merges_applied, report.merges_skipped
        );
    }
    for (collection, e) in &report.edges {
        println!(
            "  {collection}: created={} updated={} unchanged={} deleted={}",
            e.created, e.updated, e.unchanged, e.deleted
        );
    }
}

fn print_rollback_text(report: &RollbackReport) {
    println!(
        "Rolled back {} version {}; {} is current again ({:.2} ms)",
        report.namespace, report.rolled_back_version, report.restored_version, report.duration_ms
    );
    for (collection, c) in &report.collections {
        println!(
            "  {collection}: deleted={} restored={} relabelled={}",
            c.deleted, c.restored, c.relabelled
        );
    }
}

fn print_loads_text(namespace: &str, loads: &[RegistryEntry]) {
    if loads.is_empty() {
        println!("No loads registered for {namespace}");
        return;
    }
    for entry in loads {
        println!(
            "{}\t{}\t{}\t{}",
            entry.load_version,
            entry.load_timestamp,
            entry.release_timestamp,
            entry.state.as_str()
        );
    }
}

fn print_documents_text(ids: &[String], found: &BTreeMap<String, Document>) {
    for id in ids {
        match found.get(id) {
            Some(doc) => match serde_json::to_string(doc) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("{id}: {err}"),
            },
            None => println!("{id}: not found"),
        }
    }
}

/// Spinner driven by load progress events.
struct ProgressMetrics {
    bar: ProgressBar,
    processed: [AtomicU64; 3],
}

impl ProgressMetrics {
    fn new(visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner} {elapsed_precise} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            bar.set_style(style);
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            processed: Default::default(),
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl LoadMetrics for ProgressMetrics {
    fn chunk_flushed(&self, pass: LoadPass, documents: usize, _writes: usize) {
        let slot = match pass {
            LoadPass::Vertices => 0,
            LoadPass::Merges => 1,
            LoadPass::Edges => 2,
        };
        let total = self.processed[slot].fetch_add(documents as u64, Ordering::Relaxed)
            + documents as u64;
        self.bar
            .set_message(format!("{}: {total} processed", pass.as_str()));
    }

    fn sweep_completed(&self, collection: &str, expired: u64) {
        self.bar
            .set_message(format!("{collection}: {expired} expired"));
    }
}
