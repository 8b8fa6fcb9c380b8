//! atrium-core: extension runtime for the atrium admin backend
//!
//! This crate provides the host side of the atrium plugin system:
//!
//! - **Plugin registry** - [`PluginRegistry`] discovers plugins on disk,
//!   owns their lifecycle state machine, and supervises their processes
//! - **Process launcher** - spawns each plugin as an independent OS process
//!   and verifies the stdio handshake before trusting any RPC call
//! - **RPC bridge** - [`plugins::PluginClient`] drives `enable`/`disable`
//!   calls and routes the plugin's call-scoped `eval` callbacks back into
//!   the host through a broker
//! - **Settings reconciliation** - persisted enable flags are synchronized
//!   with the discovered plugin set at startup
//! - **Settings boundary** - [`SettingsStore`] is the trait the embedding
//!   host implements over its own key-value store; [`MemorySettings`] backs
//!   tests and embedders without one
//!
//! The registry is an explicit service object: construct one at host
//! startup and hand `Arc` references to whoever needs it (API handlers, the
//! shutdown sequencer). Nothing in this crate is process-global, so tests
//! build isolated instances freely.

pub mod plugins;
pub mod settings;

pub use plugins::{
    EvalHelper, HelperError, LifecycleState, NullHelper, PluginDescriptor, PluginEntry,
    PluginHostError, PluginRegistry, PluginSummary, RegistryConfig,
};
pub use settings::{MemorySettings, SettingsError, SettingsStore};
