//! atrium-plugin-api - Plugin API for the atrium admin backend
//!
//! This crate provides the traits and types needed to write plugins for
//! atrium. Plugins are standalone executables: the host spawns them as child
//! processes, performs a handshake over stdio, and drives their lifecycle
//! through line-delimited JSON frames. A crashing plugin takes down its own
//! process, never the host.
//!
//! # Example
//!
//! ```ignore
//! use atrium_plugin_api::{Helper, Plugin, PluginError, serve};
//!
//! #[derive(Default)]
//! struct MyPlugin;
//!
//! #[async_trait::async_trait]
//! impl Plugin for MyPlugin {
//!     async fn on_enable(&mut self, helper: &Helper) -> Result<(), PluginError> {
//!         let banner = helper.eval("host.banner").await?;
//!         eprintln!("enabled under {banner}");
//!         Ok(())
//!     }
//!
//!     async fn on_disable(&mut self, _helper: &Helper) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     if let Err(e) = serve(MyPlugin).await {
//!         eprintln!("{e}");
//!         std::process::exit(1);
//!     }
//! }
//! ```

pub mod error;
pub mod proto;
pub mod serve;

pub use error::PluginError;
pub use serve::{Helper, serve, serve_with_streams};

use async_trait::async_trait;

/// The plugin lifecycle contract.
///
/// Exactly two operations, called by the host over RPC. Each receives a
/// [`Helper`] that is valid only for the duration of that call; a plugin
/// must not stash it for later use.
#[async_trait]
pub trait Plugin: Send + 'static {
    /// Called when the host enables this plugin. Returning an error makes
    /// the host kill the process and leave the plugin disabled.
    async fn on_enable(&mut self, helper: &Helper) -> Result<(), PluginError>;

    /// Called when the host disables this plugin. The process is killed
    /// shortly after this returns, whatever the outcome.
    async fn on_disable(&mut self, helper: &Helper) -> Result<(), PluginError>;
}
