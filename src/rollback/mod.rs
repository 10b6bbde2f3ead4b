//! Reversal of the most recent load of a namespace.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::error::{GraphError, Result};
use crate::store::StoreFactory;

/// Changes made to one collection by a rollback.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CollectionRollback {
    /// Versions created by the rolled-back load and deleted.
    pub deleted: u64,
    /// Versions expired by the rolled-back load and made live again.
    pub restored: u64,
    /// Versions whose `last_version` reverted to the prior load.
    pub relabelled: u64,
}

/// Summary of a rollback.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RollbackReport {
    /// Registry namespace.
    pub namespace: String,
    /// Version that was removed.
    pub rolled_back_version: String,
    /// Version that is current again.
    pub restored_version: String,
    /// System time of the removed load.
    pub load_timestamp: i64,
    /// Per-collection changes.
    pub collections: BTreeMap<String, CollectionRollback>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

/// Removes the most recent load of `namespace`, restoring the state left by
/// the load before it.
///
/// The newest load is reverted whatever its state, so a load that failed
/// part way can be undone. The very first load of a namespace cannot be
/// rolled back: fewer than two registered loads fail with
/// [`GraphError::NothingToRollBack`] before anything is modified.
pub fn rollback_last_load(factory: &StoreFactory, namespace: &str) -> Result<RollbackReport> {
    let started = Instant::now();
    let registry = factory.registry()?;
    let loads = registry.get_registered_loads(namespace)?;
    let (current, prior) = match loads.as_slice() {
        [current, prior, ..] => (current, prior),
        _ => {
            return Err(GraphError::NothingToRollBack {
                namespace: namespace.to_string(),
                registered: loads.len(),
            })
        }
    };
    let store = factory.open_store(
        &current.vertex_collection,
        &current.edge_collections,
        current.merge_collection.as_deref(),
    )?;
    info!(
        namespace,
        version = %current.load_version,
        prior_version = %prior.load_version,
        load_timestamp = current.load_timestamp,
        state = current.state.as_str(),
        "rollback.start"
    );

    registry.register_load_rollback(namespace, &current.load_version)?;
    let mut report = RollbackReport {
        namespace: namespace.to_string(),
        rolled_back_version: current.load_version.clone(),
        restored_version: prior.load_version.clone(),
        load_timestamp: current.load_timestamp,
        ..RollbackReport::default()
    };
    for collection in current.collections() {
        let changes = CollectionRollback {
            deleted: store.delete_created_documents(collection, current.load_timestamp)?,
            restored: store
                .undo_expire_documents(collection, current.load_timestamp.saturating_sub(1))?,
            relabelled: store.reset_last_version(
                collection,
                &current.load_version,
                &prior.load_version,
            )?,
        };
        info!(
            collection,
            deleted = changes.deleted,
            restored = changes.restored,
            relabelled = changes.relabelled,
            "rollback.collection"
        );
        report.collections.insert(collection.to_string(), changes);
    }
    registry.delete_registered_load(namespace, &current.load_version)?;

    report.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(
        namespace,
        version = %report.rolled_back_version,
        restored_version = %report.restored_version,
        duration_ms = report.duration_ms,
        "rollback.complete"
    );
    Ok(report)
}
