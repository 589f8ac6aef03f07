//! Shroud discovery service
//!
//! Answers `GET /proxies?q=<domain>` with the proxies serving that domain.

use anyhow::{Context, Result};
use clap::Parser;
use shroud_discover::{DiscoverConfig, DiscoverServer, HickoryLookup, Resolver};
use shroud_proto::DEFAULT_PROXY_DOMAIN;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shroud discovery service - tells clients which proxies serve their domain
#[derive(Parser, Debug)]
#[command(name = "shroud-discover")]
#[command(about = "Shroud discovery service - tells clients which proxies serve their domain")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SHROUD_LISTEN_ADDR", default_value = "0.0.0.0:443")]
    listen_addr: SocketAddr,

    /// Path to TLS certificate (PEM)
    #[arg(long, env = "SHROUD_TLS_CRT")]
    tls_crt: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long, env = "SHROUD_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Serve plain HTTP (behind a TLS-terminating load balancer)
    #[arg(long)]
    plaintext: bool,

    /// The base domain for the public proxies
    #[arg(long, env = "SHROUD_PROXY_DOMAIN", default_value = DEFAULT_PROXY_DOMAIN)]
    proxy_domain: String,

    /// Nameserver to query (e.g. 8.8.8.8:53) instead of the system resolver
    #[arg(long, env = "SHROUD_NAMESERVER")]
    nameserver: Option<SocketAddr>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = DiscoverConfig::new(
        cli.listen_addr,
        cli.tls_crt,
        cli.tls_key,
        cli.plaintext,
        cli.proxy_domain,
        cli.nameserver,
    )
    .context("Invalid configuration")?;

    let lookup = match config.nameserver {
        Some(nameserver) => {
            info!("Using nameserver {}", nameserver);
            HickoryLookup::with_nameserver(nameserver)
        }
        None => HickoryLookup::from_system_conf().context("Failed to configure DNS resolver")?,
    };

    info!("Proxy domain: {}", config.proxy_domain);
    let resolver = Arc::new(Resolver::new(config.proxy_domain.clone(), Arc::new(lookup)));
    let server = DiscoverServer::new(config, resolver);

    tokio::select! {
        result = server.start() => {
            result.context("Discovery service failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
