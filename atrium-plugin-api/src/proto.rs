//! Wire protocol shared by the host and the plugin side.
//!
//! A plugin talks to the host over its own stdin/stdout with line-delimited
//! JSON frames. Both call directions are multiplexed over that one channel:
//! the host issues `plugin/enable` / `plugin/disable` requests, and for the
//! duration of such a call the plugin may issue `helper/eval` requests back,
//! tagged with the broker token the host handed it in the outer call.

use serde::{Deserialize, Serialize};

/// Environment variable carrying the handshake cookie.
///
/// The host sets this before spawning a plugin; a plugin binary launched
/// without it refuses to run, so double-clicking a plugin executable produces
/// an explanation instead of a hung process waiting on stdin.
pub const HANDSHAKE_COOKIE_ENV: &str = "ATRIUM_PLUGIN";

/// Expected value of [`HANDSHAKE_COOKIE_ENV`].
pub const HANDSHAKE_COOKIE_VALUE: &str = "halcyon-rpc-1";

/// Prefix of the handshake line a plugin writes as its very first stdout line.
pub const HANDSHAKE_KEY: &str = "atrium";

/// Protocol version negotiated in the handshake line. Host and plugin must
/// agree exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Host → plugin lifecycle calls.
pub const METHOD_ENABLE: &str = "plugin/enable";
pub const METHOD_DISABLE: &str = "plugin/disable";

/// Plugin → host callback, valid only while the broker token from the
/// enclosing lifecycle call is registered on the host side.
pub const METHOD_EVAL: &str = "helper/eval";

pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
/// The broker token does not name an open callback channel.
pub const ERROR_BROKER_CLOSED: i64 = -32000;
pub const ERROR_EVAL_FAILED: i64 = -32001;

/// Render the handshake line a plugin must emit before any frame.
pub fn handshake_line() -> String {
    format!("{HANDSHAKE_KEY}|{PROTOCOL_VERSION}")
}

/// Parse a received handshake line, returning the advertised protocol
/// version. `None` means the line is not a handshake at all.
pub fn parse_handshake(line: &str) -> Option<u32> {
    let (key, version) = line.trim().split_once('|')?;
    if key != HANDSHAKE_KEY {
        return None;
    }
    version.parse().ok()
}

/// One line on the wire.
///
/// Variants are distinguished by field presence: requests carry `method`,
/// responses carry `result`, errors carry `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
    Response {
        id: u64,
        result: serde_json::Value,
    },
    Error {
        id: u64,
        error: RpcError,
    },
}

/// Structured error carried by an error frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Params of `plugin/enable` / `plugin/disable`: the broker token naming the
/// callback channel the host keeps open for the duration of this call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LifecycleParams {
    pub broker: u64,
}

/// Result of a lifecycle call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LifecycleReply {
    pub code: ResultCode,
}

/// Outcome a plugin reports for a lifecycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    Error,
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Ok => write!(f, "ok"),
            ResultCode::Error => write!(f, "error"),
        }
    }
}

/// Params of `helper/eval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalParams {
    pub broker: u64,
    pub expr: String,
}

/// Result of `helper/eval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReply {
    pub value: String,
}
