//! CONNECT tunnel relay.
//!
//! Opens a raw TCP connection to the requested target and splices it with
//! the client. Payloads are never inspected.

use std::str::FromStr;
use std::time::Duration;

use axum::http::uri::Authority;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::net::prebuffered::Prebuffered;
use crate::observability::metrics;

/// Sent to the client once the target connection is up.
pub const CONNECTION_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection established\r\nConnection: keep-alive\r\n\r\n";

const DEFAULT_TUNNEL_PORT: u16 = 443;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid CONNECT target '{0}'")]
    InvalidTarget(String),
    #[error("failed to connect to {target}")]
    Connect {
        target: TunnelTarget,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(TunnelTarget),
    #[error("tunnel relay failed")]
    Relay(#[source] std::io::Error),
}

/// Host and port named by a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Hostname or IP literal, without brackets.
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for TunnelTarget {
    type Err = TunnelError;

    /// Parse `host[:port]`, defaulting the port to 443.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let authority = Authority::from_str(s).map_err(|_| TunnelError::InvalidTarget(s.to_string()))?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TunnelError::InvalidTarget(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port: authority.port_u16().unwrap_or(DEFAULT_TUNNEL_PORT),
        })
    }
}

/// Relays CONNECT tunnels.
#[derive(Debug, Clone)]
pub struct TunnelRelay {
    connect_timeout: Duration,
}

impl TunnelRelay {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open the raw TCP connection to the tunnel target.
    pub async fn connect(&self, target: &TunnelTarget) -> Result<TcpStream, TunnelError> {
        match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(TunnelError::Connect {
                target: target.clone(),
                source,
            }),
            Err(_) => Err(TunnelError::ConnectTimeout(target.clone())),
        }
    }

    /// Serve a CONNECT whose head sits in the first `head_len` buffered bytes.
    ///
    /// Writes the literal success line before relaying anything. Bytes the
    /// client sent after the head are forwarded once the tunnel is up.
    pub async fn serve<S>(
        &self,
        mut client: Prebuffered<S>,
        head_len: usize,
        target: &str,
    ) -> Result<(u64, u64), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target: TunnelTarget = target.parse()?;
        let upstream = match self.connect(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                metrics::record_tunnel("connect_failed");
                return Err(e);
            }
        };
        tracing::debug!(tunnel = %target, "Tunnel connected");

        client.discard(head_len);
        let (pipelined, mut client) = client.into_parts();
        client
            .write_all(CONNECTION_ESTABLISHED)
            .await
            .map_err(TunnelError::Relay)?;
        metrics::record_tunnel("established");

        splice(&mut client, upstream, &pipelined).await
    }
}

/// Relay bytes both ways until either side closes.
///
/// `pipelined` holds client bytes that were read ahead of the relay.
pub async fn splice<C>(client: &mut C, mut upstream: TcpStream, pipelined: &[u8]) -> Result<(u64, u64), TunnelError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let relay = async {
        if !pipelined.is_empty() {
            upstream.write_all(pipelined).await?;
        }
        let (up, down) = tokio::io::copy_bidirectional(client, &mut upstream).await?;
        Ok::<_, std::io::Error>((up + pipelined.len() as u64, down))
    };
    match relay.await {
        Ok((up, down)) => {
            tracing::trace!(bytes_up = up, bytes_down = down, "Tunnel finished");
            Ok((up, down))
        }
        Err(e) => {
            metrics::record_tunnel("relay_failed");
            Err(TunnelError::Relay(e))
        }
    }
}
