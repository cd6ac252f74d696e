//! Proxy server setup and connection dispatch.
//!
//! # Responsibilities
//! - Build the Axum router around the forwarding handler
//! - Accept connections under the connection limit
//! - Route CONNECT to the tunnel relay, everything else to hyper
//! - Stop accepting on the shutdown signal

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::downgrade::DowngradeTable;
use crate::http::forward::{forward, ProxyState};
use crate::http::rewrite::ContentRewriter;
use crate::http::upstream::{UpstreamConnector, UpstreamError};
use crate::net::connection::{ConnectionKind, ConnectionTracker};
use crate::net::head::{sniff_head, HeadError, RequestHead};
use crate::net::listener::{Listener, ListenerError};
use crate::net::prebuffered::Prebuffered;
use crate::net::tunnel::TunnelRelay;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("failed to set up upstream connector")]
    Upstream(#[from] UpstreamError),
}

/// The downgrade proxy.
pub struct ProxyServer {
    router: Router,
    config: ProxyConfig,
    downgrades: DowngradeTable,
    tunnels: TunnelRelay,
    connections: ConnectionTracker,
}

impl ProxyServer {
    /// Create a proxy with an empty downgrade table.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        Self::with_downgrades(config, DowngradeTable::new())
    }

    /// Create a proxy sharing an existing downgrade table.
    pub fn with_downgrades(config: ProxyConfig, downgrades: DowngradeTable) -> Result<Self, ServerError> {
        let upstream = Arc::new(UpstreamConnector::new(&config.timeouts)?);
        let tunnels = TunnelRelay::new(Duration::from_secs(config.timeouts.connect_secs));
        let state = ProxyState {
            downgrades: downgrades.clone(),
            upstream,
            rewriter: ContentRewriter::new(downgrades.clone(), config.rewrite.max_body_bytes),
            tunnels: tunnels.clone(),
        };

        Ok(Self {
            router: Self::build_router(state),
            config,
            downgrades,
            tunnels,
            connections: ConnectionTracker::new(),
        })
    }

    fn build_router(state: ProxyState) -> Router {
        Router::new()
            .fallback(forward)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Handle onto the downgrade table used by this proxy.
    pub fn downgrades(&self) -> DowngradeTable {
        self.downgrades.clone()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Run the server on an already bound socket, limited by the configured
    /// `max_connections`.
    pub async fn run(self, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        let listener = Listener::from_listener(listener, self.config.listener.max_connections);
        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until the shutdown signal fires.
    pub async fn serve(self, listener: Listener, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        let addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(
            address = %addr,
            max_connections = listener.max_connections(),
            "SSLstrip proxy listening"
        );

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
            };

            let (stream, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let router = self.router.clone();
            let tunnels = self.tunnels.clone();
            let connections = self.connections.clone();
            let max_header_bytes = self.config.listener.max_header_bytes;
            tokio::spawn(async move {
                let _permit = permit;
                serve_connection(stream, peer, router, tunnels, connections, max_header_bytes).await;
            });
        }

        tracing::info!(
            active_http = self.connections.active_http(),
            active_tunnels = self.connections.active_tunnels(),
            "Proxy server stopped"
        );
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    tunnels: TunnelRelay,
    connections: ConnectionTracker,
    max_header_bytes: usize,
) {
    stream.set_nodelay(true).ok();
    let mut stream = Prebuffered::new(stream, max_header_bytes);

    match sniff_head(&mut stream, max_header_bytes).await {
        Ok(RequestHead::Connect { target, head_len }) => {
            let guard = connections.track(ConnectionKind::Tunnel);
            let span = tracing::debug_span!("tunnel", connection_id = %guard.id(), peer = %peer, tunnel = %target);
            async {
                if let Err(e) = tunnels.serve(stream, head_len, &target).await {
                    tracing::warn!(error = %e, "Tunnel error");
                }
            }
            .instrument(span)
            .await;
        }
        Ok(RequestHead::Http) => {
            let guard = connections.track(ConnectionKind::Http);
            let span = tracing::debug_span!("http", connection_id = %guard.id(), peer = %peer);
            let service = TowerToHyperService::new(router);
            let connection = hyper::server::conn::http1::Builder::new()
                .preserve_header_case(true)
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            if let Err(e) = connection.instrument(span).await {
                tracing::debug!(peer = %peer, error = %e, "Client connection error");
            }
        }
        Err(HeadError::Closed) => {
            tracing::trace!(peer = %peer, "Client closed before sending a request");
        }
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Client error");
        }
    }
}
