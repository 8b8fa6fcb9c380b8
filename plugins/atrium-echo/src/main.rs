//! atrium-echo: the smallest useful atrium plugin.
//!
//! On enable it asks the host for its name through the helper channel and
//! reports both transitions on stderr, which the host leaves attached for
//! plugin diagnostics.

use async_trait::async_trait;
use atrium_plugin_api::{Helper, Plugin, PluginError, serve};

struct EchoPlugin;

#[async_trait]
impl Plugin for EchoPlugin {
    async fn on_enable(&mut self, helper: &Helper) -> Result<(), PluginError> {
        let host = helper
            .eval("host.name")
            .await
            .unwrap_or_else(|_| "a host without eval".to_string());
        eprintln!("atrium-echo: enabled under {host}");
        Ok(())
    }

    async fn on_disable(&mut self, _helper: &Helper) -> Result<(), PluginError> {
        eprintln!("atrium-echo: disabled");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = serve(EchoPlugin).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
