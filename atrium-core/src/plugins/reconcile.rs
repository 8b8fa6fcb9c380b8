//! Settings reconciliation
//!
//! Runs once at startup, after the manifest scan and before any process is
//! spawned: restores persisted enable flags for known plugins, writes an
//! explicit "0" for plugins seen for the first time, and garbage-collects
//! flags left behind by plugins removed from disk.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::error::PluginHostError;
use super::registry::{SETTING_PREFIX, setting_key};
use crate::settings::SettingsStore;

/// Synchronize persisted enable flags with the known plugin set.
///
/// Returns the set of identifiers whose persisted flag says they should be
/// enabled. Individual write/delete failures are logged and skipped; only a
/// failed prefix scan aborts, since nothing can be reconciled without it.
pub async fn reconcile(
    store: &dyn SettingsStore,
    known: &[Uuid],
) -> Result<HashSet<Uuid>, PluginHostError> {
    let persisted: HashMap<String, String> =
        store.scan_prefix(SETTING_PREFIX).await?.into_iter().collect();

    let mut should_enable = HashSet::new();
    for id in known {
        let key = setting_key(*id);
        match persisted.get(&key).map(String::as_str) {
            Some("1") => {
                should_enable.insert(*id);
            }
            Some(_) => {}
            None => {
                // Make the key exist going forward.
                if let Err(e) = store.set(&key, "0").await {
                    tracing::error!(plugin = %id, error = %e, "Cannot initialize plugin setting");
                }
            }
        }
    }

    let known: HashSet<&Uuid> = known.iter().collect();
    for key in persisted.keys() {
        let stale = key
            .strip_prefix(SETTING_PREFIX)
            .and_then(|suffix| Uuid::parse_str(suffix).ok())
            .is_none_or(|id| !known.contains(&id));
        if stale {
            tracing::debug!(key = %key, "Pruning setting for removed plugin");
            if let Err(e) = store.delete(key).await {
                tracing::error!(key = %key, error = %e, "Cannot delete plugin setting");
            }
        }
    }

    Ok(should_enable)
}
