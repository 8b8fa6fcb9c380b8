//! Process launcher & handshake
//!
//! Turns a [`PluginDescriptor`] into a running child process with a verified
//! control channel: render the platform command template, spawn with stdio
//! piped, and require the handshake line before handing the connection to
//! the RPC bridge. A process that fails any step is killed, never left
//! running.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use atrium_plugin_api::proto::{
    HANDSHAKE_COOKIE_ENV, HANDSHAKE_COOKIE_VALUE, PROTOCOL_VERSION, parse_handshake,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time;

use super::bridge::PluginClient;
use super::error::PluginHostError;
use super::helper::EvalHelper;
use super::manifest::PluginDescriptor;

/// Render the descriptor's command template for this platform into argv.
///
/// `$OS` / `$ARCH` tokens are substituted before shell-aware tokenization,
/// so quoted arguments containing spaces survive.
pub fn build_command(descriptor: &PluginDescriptor) -> Result<Vec<String>, PluginHostError> {
    let rendered = descriptor
        .platform_command()
        .replace("$OS", std::env::consts::OS)
        .replace("$ARCH", std::env::consts::ARCH);
    let argv = shlex::split(&rendered)
        .ok_or_else(|| PluginHostError::Invalid(format!("unparsable launch command: {rendered}")))?;
    if argv.is_empty() {
        return Err(PluginHostError::Invalid(
            "empty launch command".to_string(),
        ));
    }
    Ok(argv)
}

/// Spawn the plugin process and perform the handshake.
///
/// On success the child is connected and ready for lifecycle calls. On any
/// failure the child (if it got as far as spawning) is killed before the
/// error is returned.
pub async fn launch(
    descriptor: &PluginDescriptor,
    startup_timeout: Duration,
    helper: Arc<dyn EvalHelper>,
) -> Result<(Child, PluginClient), PluginHostError> {
    let argv = build_command(descriptor)?;
    let program = resolve_program(&argv[0], &descriptor.path);

    let mut child = Command::new(program)
        .args(&argv[1..])
        .current_dir(&descriptor.path)
        .env(HANDSHAKE_COOKIE_ENV, HANDSHAKE_COOKIE_VALUE)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        // Leave stderr alone so plugin diagnostics land in the host's logs.
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = match child.stdin.take() {
        Some(stdin) => stdin,
        None => {
            kill(&mut child).await;
            return Err(PluginHostError::Rpc(
                "failed to capture plugin stdin".to_string(),
            ));
        }
    };
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            kill(&mut child).await;
            return Err(PluginHostError::Rpc(
                "failed to capture plugin stdout".to_string(),
            ));
        }
    };

    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    match time::timeout(startup_timeout, reader.read_line(&mut line)).await {
        Err(_) => {
            kill(&mut child).await;
            return Err(PluginHostError::Timeout {
                after: startup_timeout,
            });
        }
        Ok(Err(e)) => {
            kill(&mut child).await;
            return Err(e.into());
        }
        Ok(Ok(0)) => {
            kill(&mut child).await;
            return Err(PluginHostError::Invalid(
                "plugin exited before handshake".to_string(),
            ));
        }
        Ok(Ok(_)) => {}
    }

    match parse_handshake(&line) {
        Some(PROTOCOL_VERSION) => {}
        Some(version) => {
            kill(&mut child).await;
            return Err(PluginHostError::Invalid(format!(
                "plugin speaks protocol {version}, host speaks {PROTOCOL_VERSION}"
            )));
        }
        None => {
            kill(&mut child).await;
            return Err(PluginHostError::Invalid(format!(
                "bad handshake line: {:?}",
                line.trim()
            )));
        }
    }

    let client = PluginClient::with_streams(reader, stdin, helper);
    Ok((child, client))
}

/// Forcibly terminate a child and reap it.
pub async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        // Already exited; reaping below still applies.
        tracing::debug!(error = %e, "Kill on exited plugin process");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(error = %e, "Failed to reap plugin process");
    }
}

/// A relative program path in a command template points inside the plugin
/// directory; resolution against the host's own cwd is never intended.
fn resolve_program(program: &str, plugin_root: &Path) -> std::path::PathBuf {
    let path = Path::new(program);
    if path.is_relative() && program.contains(std::path::MAIN_SEPARATOR) {
        plugin_root.join(path)
    } else {
        path.to_path_buf()
    }
}
