//! Plugin manifest parsing
//!
//! Every plugin directory carries a `plugin.toml` declaring identity,
//! version constraints, and one launch command template per platform.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use uuid::Uuid;

use super::error::PluginHostError;

/// Manifest file name inside a plugin directory
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Raw on-disk manifest shape
#[derive(Debug, Deserialize)]
struct RawManifest {
    id: Uuid,
    name: String,
    version: String,
    host_version: String,
    #[serde(default)]
    command_unix: Option<String>,
    #[serde(default)]
    command_windows: Option<String>,
}

/// Immutable descriptor produced from a parsed manifest
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Unique plugin identifier
    pub id: Uuid,
    /// Human-readable name
    pub name: String,
    /// Plugin's own version (semver)
    pub version: String,
    /// Host-compatibility constraint expression, e.g. ">=1.0, <1.1"
    pub host_version: String,
    /// Launch command template for unix-family targets
    pub command_unix: String,
    /// Launch command template for windows targets
    pub command_windows: String,
    /// Directory the plugin was discovered under
    pub path: PathBuf,
}

impl PluginDescriptor {
    /// The launch command template for the platform this host runs on.
    pub fn platform_command(&self) -> &str {
        if cfg!(windows) {
            &self.command_windows
        } else {
            &self.command_unix
        }
    }
}

/// Parse one candidate directory.
///
/// `Ok(None)` means "not a plugin": no manifest, or no launch command for
/// this platform. Both are silently skipped by the scan. A manifest that
/// exists but cannot be parsed is an error.
pub fn parse_dir(dir: &Path) -> Result<Option<PluginDescriptor>, PluginHostError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&manifest_path)?;
    let raw: RawManifest = toml::from_str(&content)
        .map_err(|e| PluginHostError::Invalid(format!("{}: {e}", manifest_path.display())))?;

    let command = if cfg!(windows) {
        raw.command_windows
    } else {
        raw.command_unix
    };
    // A manifest without a command for this platform is not launchable here;
    // treat the directory as not-a-plugin rather than an error.
    let Some(command) = command.filter(|c| !c.trim().is_empty()) else {
        return Ok(None);
    };

    let (command_unix, command_windows) = if cfg!(windows) {
        (String::new(), command)
    } else {
        (command, String::new())
    };

    Ok(Some(PluginDescriptor {
        id: raw.id,
        name: raw.name,
        version: raw.version,
        host_version: raw.host_version,
        command_unix,
        command_windows,
        path: dir.to_path_buf(),
    }))
}

/// Subdirectories of the plugin root, sorted by name so duplicate-identifier
/// resolution is deterministic across runs.
pub fn scan_root(root: &Path) -> Result<Vec<PathBuf>, PluginHostError> {
    if !root.exists() {
        tracing::debug!(dir = %root.display(), "Plugin directory does not exist");
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}
