//! Host-side helper service
//!
//! Plugins may call `helper/eval` back into the host during their own
//! lifecycle transitions. What evaluation means is the embedding host's
//! business; [`EvalHelper`] is the seam it implements. The broker hands the
//! helper to a plugin one outer call at a time, so a plugin never holds a
//! standing RPC server into the host.

use async_trait::async_trait;
use thiserror::Error;

/// Errors an eval helper can return
#[derive(Error, Debug)]
pub enum HelperError {
    /// The expression failed to evaluate
    #[error("eval failed: {0}")]
    Eval(String),

    /// This host does not support eval at all
    #[error("eval is not supported by this host")]
    Unsupported,
}

/// Host-provided expression evaluator exposed to plugins.
#[async_trait]
pub trait EvalHelper: Send + Sync {
    async fn eval(&self, expr: &str) -> Result<String, HelperError>;
}

/// Helper for hosts that expose no eval capability. Every call is answered
/// with [`HelperError::Unsupported`]; plugins still enable normally.
#[derive(Default)]
pub struct NullHelper;

#[async_trait]
impl EvalHelper for NullHelper {
    async fn eval(&self, _expr: &str) -> Result<String, HelperError> {
        Err(HelperError::Unsupported)
    }
}
