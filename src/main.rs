//! Upstream Proxy entry point.
//!
//! Loads the upstream list, starts every upstream and then serves MCP
//! requests on stdin/stdout until stdin closes.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tracing::{error, info};

use upstream_proxy::{
    config::ProxyConfig,
    frontend, telemetry,
    upstream::{TracingDiagnostics, UpstreamManager},
};

#[tokio::main]
async fn main() {
    // Load .env (if present)
    let _ = dotenv();

    telemetry::init();

    if let Err(e) = run().await {
        error!(name: "proxy.failed", error = %format!("{e:#}"), "Proxy exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ProxyConfig::load().context("failed to load proxy configuration")?;

    info!(
        name: "proxy.config.loaded",
        upstreams = config.upstream_servers.len(),
        request_timeout_secs = config.request_timeout_secs,
        "Proxy configuration loaded"
    );

    let manager = UpstreamManager::start_from_config(&config, Arc::new(TracingDiagnostics))
        .await
        .context("failed to start upstream servers")?;
    let manager = Arc::new(manager);

    for status in manager.get_servers_status() {
        info!(
            name: "upstream.ready",
            server = %status.id,
            tools = status.tools_count,
            "Upstream server ready"
        );
    }
    for tool in manager.get_all_tools() {
        info!(
            name: "upstream.tool.discovered",
            tool = %tool.name,
            server = manager.owner_of(&tool.name).unwrap_or("-"),
            "Upstream tool discovered"
        );
    }

    let served = frontend::serve(
        Arc::clone(&manager),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await;

    manager.shutdown().await;
    info!(name: "proxy.stopped", "Proxy stopped");
    served.context("stdio front end failed")
}
