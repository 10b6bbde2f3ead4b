//! Delta loading of graph snapshots into a bitemporal (time travelling) store.
//!
//! Each load of a data set writes only what changed since the previous load.
//! Nothing is destroyed: superseded versions are expired, so the graph as it
//! stood at any past load timestamp can still be queried. The most recent
//! load of a namespace can be rolled back exactly.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ttgraph::load::{from_documents, load_graph_delta, DeltaLoadOptions, NoMerges};
//! use ttgraph::storage::SqliteBackend;
//! use ttgraph::store::{BitemporalStore, StoreOptions};
//!
//! # fn main() -> ttgraph::Result<()> {
//! let backend = Arc::new(SqliteBackend::open("graph.db")?);
//! let store = BitemporalStore::create(
//!     StoreOptions::new(backend, "delta_load_registry", "taxa").default_edge_collection("child_of"),
//! )?;
//! let opts = DeltaLoadOptions::new("taxonomy", "2024-01", 1_704_067_200_000, 1_703_980_800_000);
//! let report = load_graph_delta(&store, &opts, from_documents(vec![]), from_documents(vec![]), None::<NoMerges>)?;
//! println!("{} vertices created", report.vertices.created);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod batch;
pub mod config;
pub mod error;
pub mod load;
pub mod registry;
pub mod rollback;
pub mod storage;
pub mod store;
pub mod types;

pub use error::{GraphError, Result};
pub use load::{load_graph_delta, DeltaLoadOptions, LoadReport};
pub use rollback::{rollback_last_load, RollbackReport};
pub use store::{BitemporalStore, StoreFactory, StoreOptions};
pub use types::{Document, Timestamp, INF};
