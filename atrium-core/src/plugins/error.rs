//! Plugin host error types

use std::time::Duration;

use atrium_plugin_api::proto::ResultCode;
use thiserror::Error;
use uuid::Uuid;

use crate::settings::SettingsError;

/// Errors that can occur in the plugin registry
#[derive(Error, Debug)]
pub enum PluginHostError {
    /// No plugin with this identifier is registered
    #[error("Plugin {id} not found")]
    NotFound { id: Uuid },

    /// A second manifest claimed an already-registered identifier
    #[error("Plugin ID duplicated: {incoming} and {existing} both claim {id}")]
    DuplicateId {
        id: Uuid,
        existing: String,
        incoming: String,
    },

    /// Malformed manifest, launch command, or handshake
    #[error("Plugin invalid: {0}")]
    Invalid(String),

    /// Delete attempted while the plugin is enabled
    #[error("Plugin {id} is loaded; disable it first")]
    AlreadyLoaded { id: Uuid },

    /// The plugin answered a lifecycle call with a non-OK code
    #[error("Plugin returned {code}")]
    Method { code: ResultCode },

    /// The plugin's host-version constraint is not satisfied
    #[error("Host version mismatch, need {required}")]
    VersionMismatch { required: String },

    /// An RPC call or spawn exceeded its configured bound
    #[error("Plugin call timed out after {after:?}")]
    Timeout { after: Duration },

    /// The control channel failed mid-call
    #[error("RPC transport error: {0}")]
    Rpc(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings store error
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}
