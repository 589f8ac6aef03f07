//! Shroud proxy server
//!
//! Accepts tunnels from shroud clients and routes public TLS to them by SNI.

use anyhow::{Context, Result};
use clap::Parser;
use shroud_server::{parse_optional_addr, ProxyServer, ProxyServerConfig};
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shroud proxy server - routes public TLS into client tunnels by SNI
#[derive(Parser, Debug)]
#[command(name = "shroud-server")]
#[command(about = "Shroud proxy server - routes public TLS into client tunnels by SNI")]
#[command(version)]
struct Cli {
    /// Public address listening for shroud clients
    #[arg(long, env = "SHROUD_TUNNEL_ADDR", default_value = "0.0.0.0:4443")]
    tunnel_addr: SocketAddr,

    /// Address to listen for TLS connections from the public internet
    #[arg(long, env = "SHROUD_TLS_ADDR", default_value = "0.0.0.0:443")]
    tls_addr: SocketAddr,

    /// Address redirecting plain HTTP to HTTPS ('none' disables)
    #[arg(long, env = "SHROUD_HTTP_ADDR", default_value = "0.0.0.0:80")]
    http_addr: String,

    /// Path to the tunnel TLS certificate (PEM)
    #[arg(long, env = "SHROUD_TUNNEL_TLS_CRT")]
    tunnel_tls_crt: PathBuf,

    /// Path to the tunnel TLS private key (PEM)
    #[arg(long, env = "SHROUD_TUNNEL_TLS_KEY")]
    tunnel_tls_key: PathBuf,

    /// Write log messages to this file. 'stdout' and 'none' have special meanings
    #[arg(long, env = "SHROUD_LOG", default_value = "stdout")]
    log: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified level and destination
fn setup_logging(verbose: bool, log_to: &str) -> Result<()> {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match log_to {
        "none" => {}
        "stdout" => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_thread_ids(false))
                .with(filter)
                .init();
        }
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .with(filter)
                .init();
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, &cli.log)?;

    let http_addr = parse_optional_addr(&cli.http_addr).context("Invalid --http-addr")?;
    let config = ProxyServerConfig::new(
        cli.tunnel_addr,
        cli.tls_addr,
        http_addr,
        cli.tunnel_tls_crt,
        cli.tunnel_tls_key,
    );

    let server = ProxyServer::new(config);

    tokio::select! {
        result = server.start() => {
            result.context("Proxy server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
