//! TOML configuration for the `ttgraph` binary.
//!
//! ```toml
//! [store]
//! path = "graph.db"
//! registry_collection = "delta_load_registry"
//! vertex_collection = "ncbi_taxon"
//! default_edge_collection = "ncbi_child_of_taxon"
//! merge_collection = "ncbi_taxon_merges"
//!
//! [load]
//! namespace = "ncbi_taxa"
//! batch_size = 10000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::load::DEFAULT_BATCH_SIZE;
use crate::storage::DocumentBackend;
use crate::store::{StoreFactory, StoreOptions};

const DEFAULT_REGISTRY_COLLECTION: &str = "delta_load_registry";

/// Errors raised while reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// The file parsed but holds unusable values.
    #[error("invalid config {path}: {message}")]
    Invalid {
        /// Config path.
        path: PathBuf,
        /// What is wrong.
        message: String,
    },
}

/// Backing database and collection names.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoreSection {
    /// SQLite database file. Relative paths resolve against the config file.
    pub path: PathBuf,
    /// Collection holding the load registry.
    #[serde(default = "default_registry_collection")]
    pub registry_collection: String,
    /// Vertex collection.
    pub vertex_collection: String,
    /// Edge collection used when an edge names none.
    #[serde(default)]
    pub default_edge_collection: Option<String>,
    /// Further edge collections edges may route to.
    #[serde(default)]
    pub edge_collections: Vec<String>,
    /// Merge edge collection.
    #[serde(default)]
    pub merge_collection: Option<String>,
}

/// Load defaults.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoadSection {
    /// Registry namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Entities per chunk.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            namespace: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Parsed loader configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoaderConfig {
    /// `[store]` table.
    pub store: StoreSection,
    /// `[load]` table.
    #[serde(default)]
    pub load: LoadSection,
    #[serde(skip)]
    source: PathBuf,
}

fn default_registry_collection() -> String {
    DEFAULT_REGISTRY_COLLECTION.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl LoaderConfig {
    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    /// Parses and validates TOML text as if read from `path`.
    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: LoaderConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.source = path.to_path_buf();
        if config.store.path.is_relative() {
            if let Some(parent) = path.parent() {
                config.store.path = parent.join(&config.store.path);
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.load.batch_size == 0 {
            return Err(self.invalid("load.batch_size must be positive"));
        }
        if matches!(self.load.namespace.as_deref(), Some(ns) if ns.trim().is_empty()) {
            return Err(self.invalid("load.namespace must not be empty"));
        }
        if self.store.default_edge_collection.is_none() && self.store.edge_collections.is_empty()
        {
            return Err(self.invalid(
                "store needs a default_edge_collection or at least one edge_collections entry",
            ));
        }
        Ok(())
    }

    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            path: self.source.clone(),
            message: message.into(),
        }
    }

    /// Namespace to load into: the override if given, else the configured one.
    pub fn namespace(&self, override_ns: Option<&str>) -> Result<String, ConfigError> {
        match override_ns.or(self.load.namespace.as_deref()) {
            Some(ns) if !ns.trim().is_empty() => Ok(ns.to_string()),
            _ => Err(self.invalid("no namespace configured; set load.namespace or pass --namespace")),
        }
    }

    /// Store options for the configured collections.
    pub fn store_options(&self, backend: Arc<dyn DocumentBackend>) -> StoreOptions {
        let store = &self.store;
        let mut opts = StoreOptions::new(
            backend,
            store.registry_collection.clone(),
            store.vertex_collection.clone(),
        )
        .edge_collections(store.edge_collections.iter().cloned());
        if let Some(default) = &store.default_edge_collection {
            opts = opts.default_edge_collection(default.clone());
        }
        if let Some(merge) = &store.merge_collection {
            opts = opts.merge_collection(merge.clone());
        }
        opts
    }

    /// Factory over the configured registry.
    pub fn store_factory(&self, backend: Arc<dyn DocumentBackend>) -> StoreFactory {
        StoreFactory::new(backend, self.store.registry_collection.clone())
    }
}
