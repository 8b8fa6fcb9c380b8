//! Plugin system for atrium
//!
//! This module provides the host side of the out-of-process plugin runtime:
//!
//! - [`PluginRegistry`]: discovers plugins, owns the lifecycle state machine,
//!   supervises their processes
//! - [`PluginClient`]: the connected RPC stub for one running plugin
//! - [`EvalHelper`]: the host-provided callback service plugins may call
//!   during their own lifecycle transitions
//! - [`PluginHostError`]: error taxonomy for plugin operations
//!
//! # Plugin Discovery
//!
//! Each subdirectory of the configured plugin root is a candidate. A plugin
//! directory contains:
//! - `plugin.toml` - the manifest (identity, versions, launch commands)
//! - the plugin executable the manifest's command template points at
//!
//! Directories without a manifest, or without a launch command for this
//! platform, are silently skipped.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use atrium_core::plugins::{NullHelper, PluginRegistry, RegistryConfig};
//! use atrium_core::settings::MemorySettings;
//!
//! let registry = Arc::new(PluginRegistry::new(
//!     RegistryConfig::default(),
//!     Arc::new(MemorySettings::new()),
//!     Arc::new(NullHelper),
//! ));
//!
//! // Discover plugins, restore persisted enable flags, start what should run.
//! registry.load().await?;
//!
//! // Steady state: the API layer drives lifecycles by id.
//! registry.enable(id).await?;
//! registry.disable(id).await?;
//!
//! // On host exit, tear down every running plugin.
//! registry.shutdown().await;
//! ```

mod bridge;
mod error;
mod helper;
mod launch;
mod manifest;
mod reconcile;
mod registry;
mod version;

pub use bridge::PluginClient;
pub use error::PluginHostError;
pub use helper::{EvalHelper, HelperError, NullHelper};
pub use manifest::{MANIFEST_FILE, PluginDescriptor};
pub use registry::{
    LifecycleState, PluginEntry, PluginRegistry, PluginSummary, RegistryConfig, SETTING_PREFIX,
    setting_key,
};
