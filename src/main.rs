//! SSL-stripping forwarding proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────────────┐
//!                         │                   SSLSTRIP PROXY                     │
//!                         │                                                      │
//!   Client (plaintext)    │  ┌──────────┐   CONNECT   ┌──────────────┐           │
//!   ──────────────────────┼─▶│   net    │────────────▶│ tunnel relay │◀──────────┼──▶ Origin (TLS,
//!                         │  │ listener │             └──────────────┘           │     opaque)
//!                         │  │ + sniff  │                                        │
//!                         │  └────┬─────┘                                        │
//!                         │       │ other methods                                │
//!                         │       ▼                                              │
//!                         │  ┌──────────┐  lookup  ┌───────────────┐             │
//!                         │  │ forward  │─────────▶│ downgrade     │             │
//!                         │  │ handler  │          │ table         │◀──┐         │
//!                         │  └────┬─────┘          └───────────────┘   │ record  │
//!                         │       │ http or https                      │         │
//!                         │       ▼                                    │         │
//!   Client Response       │  ┌──────────┐   HTML   ┌───────────────┐   │         │
//!   ◀─────────────────────┼──│ response │◀─────────│ rewriter      │───┘         │
//!                         │  │          │◀─────────│ (gzip/deflate)│◀────────────┼──── Origin
//!                         │  └──────────┘  other   └───────────────┘             │
//!                         └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use sslstrip_proxy::config::{load_config, validate_config, ProxyConfig};
use sslstrip_proxy::lifecycle::{signals, Shutdown};
use sslstrip_proxy::net::listener::Listener;
use sslstrip_proxy::observability::{logging, metrics};
use sslstrip_proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "sslstrip-proxy")]
#[command(about = "Forwarding proxy that keeps clients on plaintext HTTP", long_about = None)]
struct Cli {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    validate_config(&config).map_err(|errors| {
        errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    })?;

    logging::init(&config.observability.log_level);
    tracing::info!("sslstrip-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        connect_timeout_secs = config.timeouts.connect_secs,
        max_body_bytes = ?config.rewrite.max_body_bytes,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        metrics::init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let listener = match Listener::bind(&config.listener).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(bind_address = %config.listener.bind_address, error = %e, "Server error");
            return Err(e.into());
        }
    };

    let shutdown = Shutdown::new();
    let server = ProxyServer::new(config)?;
    let server_shutdown = shutdown.subscribe();
    let mut server_task = tokio::spawn(server.serve(listener, server_shutdown));

    tokio::select! {
        result = signals::shutdown_on_ctrl_c(&shutdown) => {
            result?;
            (&mut server_task).await??;
        }
        result = &mut server_task => result??,
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
