//! mcp-proxy: bridges browser MCP clients to local or remote MCP servers.
//!
//! Each `GET /sse` opens a session backed by a spawned stdio server or a
//! remote SSE server; browsers post their messages to `/message`.

mod config;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ProxyConfig};
use server::ProxyServer;
use std::path::PathBuf;
use tracing::{error, info};

/// mcp-proxy: MCP session relay for browser clients
#[derive(Parser, Debug)]
#[command(name = "mcp-proxy", version, about = "MCP session relay for browser clients")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Default stdio command offered to the web client
    #[arg(long)]
    command: Option<String>,

    /// Default stdio arguments offered to the web client
    #[arg(long, allow_hyphen_values = true)]
    args: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.mcp-proxy/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
        default_command: cli.command,
        default_args: cli.args,
    };
    let proxy_config = match ProxyConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %proxy_config.host,
        port = proxy_config.port,
        "starting mcp-proxy"
    );

    let proxy = ProxyServer::new(proxy_config);

    // SSE responses never complete on their own, so shutdown drops them
    // rather than waiting for connections to drain.
    tokio::select! {
        result = proxy.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("mcp-proxy stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
