//! Plugin registry - owns the lifecycle state machine and supervises
//! plugin processes
//!
//! The registry is safe for concurrent use: the backing map sits behind a
//! read-write lock, and each entry carries its own transition lock so a
//! slow enable on one plugin never blocks calls for another. Lifecycle
//! reads (state, message, summaries) bypass the transition lock entirely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use atrium_plugin_api::proto::ResultCode;
use semver::Version;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::bridge::PluginClient;
use super::error::PluginHostError;
use super::helper::EvalHelper;
use super::manifest::{self, PluginDescriptor};
use super::{launch, reconcile, version};
use crate::settings::SettingsStore;

/// Prefix of the persisted enable-flag keys in the settings store.
pub const SETTING_PREFIX: &str = "plugin_";

/// Settings key carrying the enable flag for one plugin.
pub fn setting_key(id: Uuid) -> String {
    format!("{SETTING_PREFIX}{id}")
}

/// Lifecycle state of a registered plugin.
///
/// `Enabled` is the only state with a live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Descriptor known, never started
    Unloaded,
    /// Known, not running
    Disabled,
    /// Process live, RPC stub usable
    Enabled,
}

/// Configuration for the plugin registry
pub struct RegistryConfig {
    /// Directory scanned for plugin subdirectories
    pub plugin_dir: PathBuf,
    /// The running host's own version, checked against each plugin's
    /// `host_version` constraint
    pub host_version: Version,
    /// Bound on each lifecycle RPC round trip
    pub rpc_timeout: Duration,
    /// Bound on process spawn plus handshake
    pub startup_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            host_version: Version::new(0, 1, 0),
            rpc_timeout: Duration::from_secs(15),
            startup_timeout: Duration::from_secs(10),
        }
    }
}

/// Serializable view of one plugin for the API layer.
///
/// This is the entire surface the admin CRUD layer depends on.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub state: LifecycleState,
    pub message: String,
}

/// Process handle and RPC stub for a running plugin.
///
/// Owned exclusively by the entry's transition lock; existing only while
/// the plugin is enabled or mid-transition.
#[derive(Default)]
struct RuntimeSlot {
    process: Option<Child>,
    client: Option<PluginClient>,
}

/// One registered plugin: immutable descriptor plus runtime state.
pub struct PluginEntry {
    descriptor: PluginDescriptor,
    state: RwLock<LifecycleState>,
    message: RwLock<String>,
    /// Transition lock: serializes enable/disable/delete for this entry and
    /// owns the process handle. Never taken by read paths.
    runtime: Mutex<RuntimeSlot>,
}

impl PluginEntry {
    fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            state: RwLock::new(LifecycleState::Unloaded),
            message: RwLock::new(String::new()),
            runtime: Mutex::new(RuntimeSlot::default()),
        }
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap()
    }

    /// Human-readable outcome of the last lifecycle attempt, empty when the
    /// last attempt succeeded.
    pub fn message(&self) -> String {
        self.message.read().unwrap().clone()
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.descriptor.id,
            name: self.descriptor.name.clone(),
            version: self.descriptor.version.clone(),
            path: self.descriptor.path.clone(),
            state: self.state(),
            message: self.message(),
        }
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.write().unwrap() = state;
    }

    fn set_message(&self, message: impl Into<String>) {
        *self.message.write().unwrap() = message.into();
    }
}

/// The plugin registry.
///
/// Constructed once at host startup and injected by reference into every
/// consumer; tests build isolated instances the same way.
pub struct PluginRegistry {
    /// Registered entries plus registration order (for stable listings and
    /// deterministic bulk enable).
    entries: RwLock<(HashMap<Uuid, Arc<PluginEntry>>, Vec<Uuid>)>,
    settings: Arc<dyn SettingsStore>,
    helper: Arc<dyn EvalHelper>,
    config: RegistryConfig,
}

impl PluginRegistry {
    pub fn new(
        config: RegistryConfig,
        settings: Arc<dyn SettingsStore>,
        helper: Arc<dyn EvalHelper>,
    ) -> Self {
        Self {
            entries: RwLock::new((HashMap::new(), Vec::new())),
            settings,
            helper,
            config,
        }
    }

    // ─── Startup ─────────────────────────────────────────────────────

    /// Discover plugins, reconcile persisted flags, and start everything
    /// flagged enabled.
    ///
    /// Per-plugin failures (unparsable manifest, failed start) are logged
    /// and skipped; the host finishes starting with a partially-enabled
    /// plugin set rather than refusing to start.
    pub async fn load(&self) -> Result<(), PluginHostError> {
        for dir in manifest::scan_root(&self.config.plugin_dir)? {
            match self.parse(&dir) {
                Ok(Some(entry)) => {
                    tracing::debug!(
                        plugin = %entry.descriptor.name,
                        id = %entry.descriptor.id,
                        path = %dir.display(),
                        "Plugin parsed"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(path = %dir.display(), error = %e, "Parse plugin error");
                }
            }
        }

        let known: Vec<Uuid> = self.entries.read().unwrap().1.clone();
        let should_enable = reconcile::reconcile(self.settings.as_ref(), &known).await?;

        for id in known {
            if !should_enable.contains(&id) {
                continue;
            }
            if let Err(e) = self.enable(id).await {
                tracing::error!(plugin = %id, error = %e, "Enable plugin error");
                self.persist_flag(id, false).await;
            }
        }
        Ok(())
    }

    /// Parse one directory and register the resulting entry.
    ///
    /// `Ok(None)` when the directory is not a plugin. A manifest reusing an
    /// already-registered identifier is rejected; the existing entry wins.
    pub fn parse(&self, dir: &Path) -> Result<Option<Arc<PluginEntry>>, PluginHostError> {
        let Some(descriptor) = manifest::parse_dir(dir)? else {
            return Ok(None);
        };

        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.0.get(&descriptor.id) {
            return Err(PluginHostError::DuplicateId {
                id: descriptor.id,
                existing: existing.descriptor.name.clone(),
                incoming: descriptor.name,
            });
        }
        let id = descriptor.id;
        let entry = Arc::new(PluginEntry::new(descriptor));
        entries.0.insert(id, entry.clone());
        entries.1.push(id);
        Ok(Some(entry))
    }

    // ─── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, id: Uuid) -> Option<Arc<PluginEntry>> {
        self.entries.read().unwrap().0.get(&id).cloned()
    }

    /// All entries in registration order.
    pub fn get_all(&self) -> Vec<Arc<PluginEntry>> {
        let entries = self.entries.read().unwrap();
        entries
            .1
            .iter()
            .filter_map(|id| entries.0.get(id).cloned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap().0.len()
    }

    pub fn summary(&self, id: Uuid) -> Option<PluginSummary> {
        self.get(id).map(|entry| entry.summary())
    }

    pub fn summaries(&self) -> Vec<PluginSummary> {
        self.get_all().iter().map(|entry| entry.summary()).collect()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Enable a plugin: version gate, spawn + handshake, `plugin/enable`
    /// RPC, persist the flag. No-op if already enabled.
    ///
    /// Every failure path kills whatever process was spawned and leaves the
    /// entry `Disabled` with a message describing what went wrong.
    pub async fn enable(&self, id: Uuid) -> Result<(), PluginHostError> {
        let entry = self.get(id).ok_or(PluginHostError::NotFound { id })?;
        let mut slot = entry.runtime.lock().await;
        if entry.state() == LifecycleState::Enabled {
            return Ok(());
        }

        if let Err(e) = version::check(&self.config.host_version, &entry.descriptor.host_version) {
            entry.set_message(e.to_string());
            entry.set_state(LifecycleState::Disabled);
            self.persist_flag(id, false).await;
            tracing::error!(
                plugin = %entry.descriptor.name,
                constraint = %entry.descriptor.host_version,
                host = %self.config.host_version,
                "Plugin version gate failed"
            );
            return Err(e);
        }

        let (mut child, client) = match launch::launch(
            &entry.descriptor,
            self.config.startup_timeout,
            self.helper.clone(),
        )
        .await
        {
            Ok(connected) => connected,
            Err(e) => {
                entry.set_message(format!("failed to start plugin: {e}"));
                entry.set_state(LifecycleState::Disabled);
                return Err(e);
            }
        };

        match client.enable(self.config.rpc_timeout).await {
            Ok(ResultCode::Ok) => {}
            Ok(code) => {
                launch::kill(&mut child).await;
                entry.set_message(format!("plugin refused to enable: {code}"));
                entry.set_state(LifecycleState::Disabled);
                return Err(PluginHostError::Method { code });
            }
            Err(e) => {
                launch::kill(&mut child).await;
                entry.set_message(format!("enable call failed: {e}"));
                entry.set_state(LifecycleState::Disabled);
                return Err(e);
            }
        }

        slot.process = Some(child);
        slot.client = Some(client);
        self.persist_flag(id, true).await;
        entry.set_message(String::new());
        entry.set_state(LifecycleState::Enabled);
        tracing::info!(plugin = %entry.descriptor.name, id = %id, "Plugin enabled");
        Ok(())
    }

    /// Disable a plugin. No-op if not enabled.
    ///
    /// The `plugin/disable` RPC is best-effort: a wedged or already-dead
    /// process must still be clearable, so RPC failure is logged and the
    /// local transition proceeds — persist the flag, kill, mark disabled.
    pub async fn disable(&self, id: Uuid) -> Result<(), PluginHostError> {
        let entry = self.get(id).ok_or(PluginHostError::NotFound { id })?;
        let mut slot = entry.runtime.lock().await;
        if entry.state() != LifecycleState::Enabled {
            return Ok(());
        }

        if let Some(client) = slot.client.as_ref() {
            match client.disable(self.config.rpc_timeout).await {
                Ok(ResultCode::Ok) => {}
                Ok(code) => {
                    tracing::warn!(plugin = %entry.descriptor.name, code = %code, "Plugin disable returned error");
                }
                Err(e) => {
                    tracing::warn!(plugin = %entry.descriptor.name, error = %e, "Plugin disable call failed");
                }
            }
        }

        self.persist_flag(id, false).await;
        if let Some(mut child) = slot.process.take() {
            launch::kill(&mut child).await;
        }
        slot.client = None;
        entry.set_message(String::new());
        entry.set_state(LifecycleState::Disabled);
        tracing::info!(plugin = %entry.descriptor.name, id = %id, "Plugin disabled");
        Ok(())
    }

    /// Remove a plugin: its registry entry, its files on disk, and its
    /// persisted setting. The plugin must not be enabled.
    pub async fn delete(&self, id: Uuid) -> Result<(), PluginHostError> {
        let entry = self.get(id).ok_or(PluginHostError::NotFound { id })?;
        let slot = entry.runtime.lock().await;
        if entry.state() == LifecycleState::Enabled {
            return Err(PluginHostError::AlreadyLoaded { id });
        }
        {
            let mut entries = self.entries.write().unwrap();
            entries.0.remove(&id);
            entries.1.retain(|other| *other != id);
        }
        drop(slot);

        if let Err(e) = tokio::fs::remove_dir_all(&entry.descriptor.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        if let Err(e) = self.settings.delete(&setting_key(id)).await {
            tracing::error!(plugin = %id, error = %e, "Cannot delete plugin setting");
        }
        tracing::info!(plugin = %entry.descriptor.name, id = %id, "Plugin deleted");
        Ok(())
    }

    /// Tear down every enabled plugin: best-effort disable RPC, then a
    /// forced kill.
    ///
    /// Entries are handled as an unordered fan-out, each bounded by its own
    /// RPC timeout, so one hanging plugin cannot stall the teardown of the
    /// others. Persisted flags are left untouched: what was enabled at
    /// shutdown comes back enabled on the next start.
    pub async fn shutdown(&self) {
        let mut set = JoinSet::new();
        for entry in self.get_all() {
            if entry.state() != LifecycleState::Enabled {
                continue;
            }
            let rpc_timeout = self.config.rpc_timeout;
            set.spawn(async move {
                let mut slot = entry.runtime.lock().await;
                if entry.state() != LifecycleState::Enabled {
                    return;
                }
                if let Some(client) = slot.client.as_ref() {
                    match client.disable(rpc_timeout).await {
                        Ok(ResultCode::Ok) => {}
                        Ok(code) => {
                            tracing::warn!(plugin = %entry.descriptor.name, code = %code, "Plugin disable returned error");
                        }
                        Err(e) => {
                            tracing::warn!(plugin = %entry.descriptor.name, error = %e, "Plugin disable call failed");
                        }
                    }
                }
                if let Some(mut child) = slot.process.take() {
                    launch::kill(&mut child).await;
                }
                slot.client = None;
                entry.set_state(LifecycleState::Disabled);
                tracing::debug!(plugin = %entry.descriptor.name, "Plugin shut down");
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Persist the enable flag. Store failures are logged, not propagated:
    /// a settings hiccup must not wedge a lifecycle transition.
    async fn persist_flag(&self, id: Uuid, enabled: bool) {
        let value = if enabled { "1" } else { "0" };
        if let Err(e) = self.settings.set(&setting_key(id), value).await {
            tracing::error!(plugin = %id, error = %e, "Cannot set plugin setting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::helper::NullHelper;
    use crate::settings::MemorySettings;
    use tempfile::TempDir;

    fn test_registry(plugin_dir: PathBuf) -> PluginRegistry {
        PluginRegistry::new(
            RegistryConfig {
                plugin_dir,
                host_version: Version::new(1, 0, 5),
                rpc_timeout: Duration::from_secs(2),
                startup_timeout: Duration::from_secs(2),
            },
            Arc::new(MemorySettings::new()),
            Arc::new(NullHelper),
        )
    }

    fn write_manifest(root: &Path, dir_name: &str, id: Uuid, name: &str) -> PathBuf {
        let dir = root.join(dir_name);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join(manifest::MANIFEST_FILE),
            format!(
                r#"
id = "{id}"
name = "{name}"
version = "0.1.0"
host_version = ">=1.0, <2.0"
command_unix = "./run"
command_windows = "run.exe"
"#
            ),
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_setting_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            setting_key(id),
            "plugin_00000000-0000-0000-0000-000000000000"
        );
    }

    #[tokio::test]
    async fn test_distinct_manifests_all_register() {
        let root = TempDir::new().unwrap();
        let registry = test_registry(root.path().to_path_buf());
        for i in 0..3 {
            write_manifest(root.path(), &format!("p{i}"), Uuid::new_v4(), "plugin");
        }

        registry.load().await.unwrap();
        assert_eq!(registry.count(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_identifier_first_wins() {
        let root = TempDir::new().unwrap();
        let registry = test_registry(root.path().to_path_buf());
        let id = Uuid::new_v4();
        // Scan order is name-sorted, so "a-first" registers before "b-dup".
        write_manifest(root.path(), "a-first", id, "first");
        write_manifest(root.path(), "b-dup", id, "second");
        write_manifest(root.path(), "c-other", Uuid::new_v4(), "other");

        registry.load().await.unwrap();
        assert_eq!(registry.count(), 2);
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.descriptor().name, "first");
    }

    #[tokio::test]
    async fn test_non_plugin_directories_are_skipped() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("empty")).unwrap();
        let registry = test_registry(root.path().to_path_buf());

        registry.load().await.unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_errors() {
        let registry = test_registry(PathBuf::from("nonexistent-root"));
        let id = Uuid::new_v4();
        assert!(matches!(
            registry.enable(id).await.unwrap_err(),
            PluginHostError::NotFound { .. }
        ));
        assert!(matches!(
            registry.disable(id).await.unwrap_err(),
            PluginHostError::NotFound { .. }
        ));
        assert!(matches!(
            registry.delete(id).await.unwrap_err(),
            PluginHostError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_disable_is_noop_when_not_enabled() {
        let root = TempDir::new().unwrap();
        let registry = test_registry(root.path().to_path_buf());
        let id = Uuid::new_v4();
        write_manifest(root.path(), "p", id, "plugin");
        registry.load().await.unwrap();

        registry.disable(id).await.unwrap();
        assert_eq!(registry.get(id).unwrap().state(), LifecycleState::Unloaded);
    }

    #[tokio::test]
    async fn test_version_gate_blocks_enable() {
        let root = TempDir::new().unwrap();
        let registry = test_registry(root.path().to_path_buf());
        let id = Uuid::new_v4();
        let dir = root.path().join("gated");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join(manifest::MANIFEST_FILE),
            format!(
                r#"
id = "{id}"
name = "gated"
version = "0.1.0"
host_version = ">=2.0"
command_unix = "./run"
command_windows = "run.exe"
"#
            ),
        )
        .unwrap();
        registry.load().await.unwrap();

        let err = registry.enable(id).await.unwrap_err();
        assert!(matches!(err, PluginHostError::VersionMismatch { .. }));
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.state(), LifecycleState::Disabled);
        assert!(entry.message().contains(">=2.0"));
    }

    #[tokio::test]
    async fn test_delete_removes_entry_files_and_setting() {
        let root = TempDir::new().unwrap();
        let settings = Arc::new(MemorySettings::new());
        let registry = PluginRegistry::new(
            RegistryConfig {
                plugin_dir: root.path().to_path_buf(),
                host_version: Version::new(1, 0, 5),
                rpc_timeout: Duration::from_secs(2),
                startup_timeout: Duration::from_secs(2),
            },
            settings.clone(),
            Arc::new(NullHelper),
        );
        let id = Uuid::new_v4();
        let dir = write_manifest(root.path(), "doomed", id, "doomed");
        registry.load().await.unwrap();
        assert_eq!(
            settings.get(&setting_key(id)).await.unwrap().as_deref(),
            Some("0")
        );

        registry.delete(id).await.unwrap();
        assert_eq!(registry.count(), 0);
        assert!(!dir.exists());
        assert_eq!(settings.get(&setting_key(id)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_summaries_expose_state_and_message() {
        let root = TempDir::new().unwrap();
        let registry = test_registry(root.path().to_path_buf());
        let id = Uuid::new_v4();
        write_manifest(root.path(), "p", id, "plugin");
        registry.load().await.unwrap();

        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, id);
        assert_eq!(summaries[0].name, "plugin");
        assert_eq!(summaries[0].state, LifecycleState::Unloaded);
        assert!(registry.summary(id).is_some());
        assert!(registry.summary(Uuid::new_v4()).is_none());
    }
}
