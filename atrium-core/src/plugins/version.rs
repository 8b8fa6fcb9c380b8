//! Version gate
//!
//! Evaluates a plugin's host-compatibility constraint against the running
//! host version. Checked on every enable path, so a host upgrade
//! retroactively blocks plugins whose constraint no longer holds.

use semver::{Version, VersionReq};

use super::error::PluginHostError;

/// Check `constraint` (e.g. ">=1.0, <1.1") against the host version.
///
/// A malformed constraint fails closed: the plugin stays disabled rather
/// than running against a host it never agreed to.
pub fn check(host: &Version, constraint: &str) -> Result<(), PluginHostError> {
    let req = VersionReq::parse(constraint).map_err(|e| {
        tracing::warn!(constraint = %constraint, error = %e, "Malformed host version constraint");
        PluginHostError::Invalid(format!("host version constraint {constraint:?}: {e}"))
    })?;
    if req.matches(host) {
        Ok(())
    } else {
        Err(PluginHostError::VersionMismatch {
            required: constraint.to_string(),
        })
    }
}
