//! Shroud client
//!
//! Exposes a local TLS service to the internet anonymously: tunnels to the
//! public proxies are dialed through Tor, so the proxies never learn where
//! the service runs.

use anyhow::{Context, Result};
use clap::Parser;
use shroud_client::{
    ClientConfig, ProxyDiscoverer, ProxySource, RelayEngine, ServiceConfig, TunnelOrchestrator,
};
use shroud_proto::DEFAULT_DISCOVER_URL;
use shroud_transport::{AnonymousDialer, Socks5Dialer};
use shroud_transport_h2::{H2TunnelConfig, H2TunnelConnector};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shroud - expose TLS services to the internet anonymously through Tor
#[derive(Parser, Debug)]
#[command(name = "shroud")]
#[command(about = "Shroud - expose TLS services to the internet anonymously through Tor")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Shroud exposes TLS services to the internet anonymously through Tor so that
the location of the service can not be determined. Shroud requires that you
first CNAME the DNS for the service's domain to a public shroud proxy server.

EXAMPLES:
  # Expose port 5050 anonymously for example.com's TLS traffic
  shroud example.com 5050

  # Terminate TLS locally and forward plaintext to 10.0.0.5:8080
  shroud example.com 10.0.0.5:8080 --tls-crt example.crt --tls-key example.key

  # Skip discovery and tunnel through known proxies
  shroud example.com 5050 --proxy-addrs 0.us.proxy.v1.shroud.io:4443
"#)]
struct Cli {
    /// Domain to accept connections for
    domain: String,

    /// Local port or address to forward to
    address: String,

    /// Explicit comma-delimited list of public proxies to tunnel through
    #[arg(long, env = "SHROUD_PROXY_ADDRS")]
    proxy_addrs: Option<String>,

    /// URL to query at startup for the proxy servers to use
    /// [default: https://discover.v1.shroud.io/proxies]
    #[arg(long, env = "SHROUD_DISCOVER_URL")]
    discover_url: Option<String>,

    /// Address of the Tor SOCKS5 port
    #[arg(long, env = "SHROUD_TOR_ADDR", default_value = "127.0.0.1:9050")]
    tor_addr: String,

    /// SOCKS5 username, Tor uses it to isolate circuits
    #[arg(long, env = "SHROUD_TOR_USER", requires = "tor_pass")]
    tor_user: Option<String>,

    /// SOCKS5 password
    #[arg(long, env = "SHROUD_TOR_PASS", requires = "tor_user")]
    tor_pass: Option<String>,

    /// TLS certificate used to decrypt incoming traffic before forwarding
    #[arg(long, env = "SHROUD_TLS_CRT")]
    tls_crt: Option<PathBuf>,

    /// TLS private key used to decrypt incoming traffic before forwarding
    #[arg(long, env = "SHROUD_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Extra CA certificate (PEM) trusted for proxies and discovery
    #[arg(long, env = "SHROUD_TUNNEL_CA")]
    tunnel_ca: Option<PathBuf>,

    /// Maximum concurrent relays per proxy (0 = unbounded)
    #[arg(long, env = "SHROUD_MAX_RELAYS", default_value = "0")]
    max_relays: usize,

    /// Write log messages to this file. 'stdout' and 'none' have special meanings
    #[arg(long, env = "SHROUD_LOG", default_value = "stdout")]
    log: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Validate everything before touching the network
    fn into_config(self) -> Result<ClientConfig> {
        let service = ServiceConfig::new(&self.domain, &self.address, self.tls_crt, self.tls_key)?;

        // The default URL only applies when no proxies are given
        let discover_url = match (&self.discover_url, &self.proxy_addrs) {
            (Some(url), _) => Some(url.as_str()),
            (None, None) => Some(DEFAULT_DISCOVER_URL),
            (None, Some(_)) => None,
        };
        let proxy_source =
            ProxySource::from_options(self.proxy_addrs.as_deref(), discover_url)?;

        let tor_credentials = match (self.tor_user, self.tor_pass) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        Ok(ClientConfig {
            service,
            proxy_source,
            tor_addr: self.tor_addr,
            tor_credentials,
            tunnel_ca: self.tunnel_ca,
            max_relays: self.max_relays,
        })
    }
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

async fn run(config: ClientConfig, cancel: CancellationToken) -> Result<()> {
    let extra_roots = match &config.tunnel_ca {
        Some(path) => shroud_cert::load_certs(path).context("Failed to load --tunnel-ca")?,
        None => Vec::new(),
    };

    let engine = RelayEngine::new(&config.service).context("Failed to load TLS configuration")?;
    if engine.terminates_tls() {
        info!("Terminating TLS before forwarding to {}", engine.service_addr());
    }

    let mut socks = Socks5Dialer::new(config.tor_addr.clone());
    if let Some((user, pass)) = &config.tor_credentials {
        socks = socks.with_credentials(user.clone(), pass.clone());
    }
    info!("Dialing through Tor at {}", socks.proxy_addr());
    let dialer: Arc<dyn AnonymousDialer> = Arc::new(socks);

    let discoverer = ProxyDiscoverer::new(dialer.clone(), &extra_roots)?;
    let endpoints = tokio::select! {
        endpoints = config.proxy_source.endpoints(&config.service.domain, &discoverer) => {
            endpoints.context("Failed to discover proxies")?
        }
        _ = cancel.cancelled() => return Ok(()),
    };

    let connector = H2TunnelConnector::new(dialer, &extra_roots, H2TunnelConfig::default())
        .context("Failed to set up tunnel transport")?;
    let orchestrator =
        TunnelOrchestrator::new(Arc::new(connector), config.service.domain.clone(), engine)
            .with_max_relays(config.max_relays);

    info!(
        "Exposing {} for {} through {} proxies",
        config.service.local_addr,
        config.service.domain,
        endpoints.len()
    );

    let outcomes = orchestrator.run(endpoints, cancel).await;
    for outcome in &outcomes {
        match &outcome.error {
            Some(e) => warn!(endpoint = %outcome.endpoint, "Ended: {}", e),
            None => info!(
                endpoint = %outcome.endpoint,
                relays = outcome.relays,
                "Ended: {}", outcome.state
            ),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, &cli.log)?;

    let config = cli.into_config().context("Invalid arguments")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                cancel.cancel();
            }
        }
    });

    if let Err(e) = run(config, cancel).await {
        error!("{:#}", e);
        return Err(e);
    }

    info!("Shroud stopped");
    Ok(())
}
