use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::{check_edge_document, DocumentBackend, Filter, Patch};
use crate::error::{GraphError, Result};
use crate::types::{
    fields, valid_at, validate_collection_name, CollectionKind, Document, IndexSpec, Timestamp,
};

/// Volatile backend keeping every collection in process memory.
///
/// Point-in-time lookups go through an `id -> keys` map; the declared
/// indexes are tracked as schema metadata only.
#[derive(Default)]
pub struct MemoryBackend {
    collections: RwLock<FxHashMap<String, MemCollection>>,
}

struct MemCollection {
    kind: CollectionKind,
    indexes: Vec<IndexSpec>,
    docs: BTreeMap<String, Document>,
    by_id: FxHashMap<String, BTreeSet<String>>,
}

impl MemCollection {
    fn new(kind: CollectionKind) -> Self {
        Self {
            kind,
            indexes: Vec::new(),
            docs: BTreeMap::new(),
            by_id: FxHashMap::default(),
        }
    }

    fn unlink(&mut self, key: &str, doc: &Document) {
        if let Some(id) = doc.get(fields::ID).and_then(Value::as_str) {
            if let Some(keys) = self.by_id.get_mut(id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_id.remove(id);
                }
            }
        }
    }

    fn link(&mut self, key: &str, doc: &Document) {
        if let Some(id) = doc.get(fields::ID).and_then(Value::as_str) {
            self.by_id
                .entry(id.to_string())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn put(&mut self, key: String, doc: Document) {
        if let Some(old) = self.docs.remove(&key) {
            self.unlink(&key, &old);
        }
        self.link(&key, &doc);
        self.docs.insert(key, doc);
    }

    fn take(&mut self, key: &str) -> Option<Document> {
        let doc = self.docs.remove(key)?;
        self.unlink(key, &doc);
        Some(doc)
    }

    fn matching_keys(&self, filter: &Filter) -> Vec<String> {
        self.docs
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

fn key_of(doc: &Document) -> Result<String> {
    match doc.get(fields::KEY) {
        Some(Value::String(key)) => Ok(key.clone()),
        _ => Err(GraphError::InvalidDocument(
            "document has no string '_key'".into(),
        )),
    }
}

fn missing(name: &str) -> GraphError {
    GraphError::Configuration(format!("collection {name} does not exist"))
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection, or `None` if it does not exist.
    pub fn len(&self, name: &str) -> Option<usize> {
        self.collections.read().get(name).map(|c| c.docs.len())
    }

    /// Every document in a collection ordered by `_key`.
    pub fn dump(&self, name: &str) -> Result<Vec<Document>> {
        let guard = self.collections.read();
        let col = guard.get(name).ok_or_else(|| missing(name))?;
        Ok(col.docs.values().cloned().collect())
    }

    fn with_collection<T>(
        &self,
        name: &str,
        f: impl FnOnce(&MemCollection) -> Result<T>,
    ) -> Result<T> {
        let guard = self.collections.read();
        let col = guard.get(name).ok_or_else(|| missing(name))?;
        f(col)
    }

    fn with_collection_mut<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MemCollection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.collections.write();
        let col = guard.get_mut(name).ok_or_else(|| missing(name))?;
        f(col)
    }
}

impl DocumentBackend for MemoryBackend {
    fn create_collection(&self, name: &str, kind: CollectionKind) -> Result<()> {
        validate_collection_name(name)?;
        let mut guard = self.collections.write();
        match guard.get(name) {
            Some(existing) if existing.kind != kind => Err(GraphError::Configuration(format!(
                "{name} already exists and is not {} collection",
                kind.describe()
            ))),
            Some(_) => Ok(()),
            None => {
                guard.insert(name.to_string(), MemCollection::new(kind));
                Ok(())
            }
        }
    }

    fn collection_kind(&self, name: &str) -> Result<Option<CollectionKind>> {
        Ok(self.collections.read().get(name).map(|c| c.kind))
    }

    fn ensure_index(&self, name: &str, spec: &IndexSpec) -> Result<()> {
        self.with_collection_mut(name, |col| {
            if !col.indexes.contains(spec) {
                col.indexes.push(spec.clone());
            }
            Ok(())
        })
    }

    fn indexes(&self, name: &str) -> Result<Vec<IndexSpec>> {
        self.with_collection(name, |col| Ok(col.indexes.clone()))
    }

    fn insert(&self, name: &str, doc: Document) -> Result<()> {
        let key = key_of(&doc)?;
        self.with_collection_mut(name, |col| {
            if col.docs.contains_key(&key) {
                return Err(GraphError::DuplicateKey {
                    collection: name.to_string(),
                    key,
                });
            }
            check_edge_document(col.kind, name, &doc)?;
            col.put(key, doc);
            Ok(())
        })
    }

    fn get(&self, name: &str, key: &str) -> Result<Option<Document>> {
        self.with_collection(name, |col| Ok(col.docs.get(key).cloned()))
    }

    fn update(&self, name: &str, key: &str, patch: &Patch) -> Result<bool> {
        self.with_collection_mut(name, |col| {
            let Some(mut doc) = col.take(key) else {
                return Ok(false);
            };
            patch.apply(&mut doc);
            col.put(key.to_string(), doc);
            Ok(true)
        })
    }

    fn remove(&self, name: &str, key: &str) -> Result<bool> {
        self.with_collection_mut(name, |col| Ok(col.take(key).is_some()))
    }

    fn import_bulk(&self, name: &str, docs: Vec<Document>) -> Result<()> {
        self.with_collection_mut(name, |col| {
            // validate the whole batch before touching anything
            let mut merged = Vec::with_capacity(docs.len());
            let mut staged: FxHashMap<String, Document> = FxHashMap::default();
            for incoming in docs {
                let key = key_of(&incoming)?;
                let mut doc = staged
                    .remove(&key)
                    .or_else(|| col.docs.get(&key).cloned())
                    .unwrap_or_default();
                for (field, value) in incoming {
                    doc.insert(field, value);
                }
                check_edge_document(col.kind, name, &doc)?;
                staged.insert(key.clone(), doc);
                merged.push(key);
            }
            for key in merged {
                if let Some(doc) = staged.remove(&key) {
                    col.put(key, doc);
                }
            }
            Ok(())
        })
    }

    fn find_valid(
        &self,
        name: &str,
        ids: &[String],
        timestamp: Timestamp,
    ) -> Result<Vec<Document>> {
        self.with_collection(name, |col| {
            let mut out = Vec::new();
            let ids: BTreeSet<&String> = ids.iter().collect();
            for id in ids {
                let Some(keys) = col.by_id.get(id) else {
                    continue;
                };
                for key in keys {
                    if let Some(doc) = col.docs.get(key) {
                        if valid_at(doc, timestamp) {
                            out.push(doc.clone());
                        }
                    }
                }
            }
            Ok(out)
        })
    }

    fn find_where(&self, name: &str, filter: &Filter) -> Result<Vec<Document>> {
        self.with_collection(name, |col| {
            Ok(col
                .docs
                .values()
                .filter(|doc| filter.matches(doc))
                .cloned()
                .collect())
        })
    }

    fn update_where(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<u64> {
        self.with_collection_mut(name, |col| {
            let keys = col.matching_keys(filter);
            for key in &keys {
                if let Some(mut doc) = col.take(key) {
                    patch.apply(&mut doc);
                    col.put(key.clone(), doc);
                }
            }
            Ok(keys.len() as u64)
        })
    }

    fn remove_where(&self, name: &str, filter: &Filter) -> Result<u64> {
        self.with_collection_mut(name, |col| {
            let keys = col.matching_keys(filter);
            for key in &keys {
                col.take(key);
            }
            Ok(keys.len() as u64)
        })
    }
}
