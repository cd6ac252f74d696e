//! Outbound requests to origin servers.
//!
//! # Responsibilities
//! - Build the outbound request descriptor from an inbound request
//! - Connect over plaintext TCP or TLS, bounded by the connect timeout
//! - Send one request per upstream connection and return its response head

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::uri::{Authority, PathAndQuery};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::TimeoutConfig;

/// Scheme chosen for the upstream leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn from_secure(secure: bool) -> Self {
        if secure {
            Self::Https
        } else {
            Self::Http
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Problems with the inbound request itself.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("request has no Host header and no absolute target")]
    MissingHost,
    #[error("invalid host '{0}'")]
    InvalidHost(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("invalid TLS client configuration")]
    TlsConfig(#[from] tokio_rustls::rustls::Error),
    #[error("invalid TLS server name '{0}'")]
    ServerName(String),
    #[error("TLS handshake with {host} failed")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP handshake failed")]
    Handshake(#[source] hyper::Error),
    #[error("upstream request failed")]
    Request(#[source] hyper::Error),
    #[error("timed out waiting for the upstream response from {0}")]
    ResponseTimeout(String),
}

/// Everything needed to issue one upstream request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub scheme: UpstreamScheme,
    /// Hostname or IP literal, without brackets.
    pub host: String,
    pub port: u16,
    pub path: PathAndQuery,
    pub method: Method,
    pub headers: HeaderMap,
}

impl OutboundRequest {
    /// Derive the descriptor from an inbound request head.
    ///
    /// The port comes from the `Host` header, else the scheme default. POST
    /// requests are tagged as XHR asking for JSON.
    pub fn from_parts(parts: &Parts, scheme: UpstreamScheme) -> Result<Self, ForwardError> {
        let authority = inbound_authority(parts)?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or_else(|| scheme.default_port());
        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let mut headers = parts.headers.clone();
        if !headers.contains_key(header::HOST) {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|_| ForwardError::InvalidHost(authority.to_string()))?;
            headers.insert(header::HOST, value);
        }
        if parts.method == Method::POST {
            headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
            headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
            method: parts.method.clone(),
            headers,
        })
    }

    /// `host:port` for logs and errors.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn into_request(self, body: Body) -> Request<Body> {
        let mut request = Request::new(body);
        *request.method_mut() = self.method;
        *request.uri_mut() = self.path.into();
        *request.headers_mut() = self.headers;
        request
    }
}

/// The authority the client asked for, from `Host` or an absolute target.
pub fn inbound_authority(parts: &Parts) -> Result<Authority, ForwardError> {
    if let Some(host) = parts.headers.get(header::HOST) {
        let host = host
            .to_str()
            .map_err(|_| ForwardError::InvalidHost(String::from_utf8_lossy(host.as_bytes()).into_owned()))?;
        return Authority::from_str(host).map_err(|_| ForwardError::InvalidHost(host.to_string()));
    }
    parts.uri.authority().cloned().ok_or(ForwardError::MissingHost)
}

/// Opens upstream connections and sends requests over them.
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl UpstreamConnector {
    /// Connector trusting the webpki root set.
    pub fn new(timeouts: &TimeoutConfig) -> Result<Self, UpstreamError> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout: Duration::from_secs(timeouts.connect_secs),
            response_timeout: Duration::from_secs(timeouts.response_secs),
        })
    }

    /// Send `outbound` with `body` and wait for the response head.
    pub async fn send(&self, outbound: OutboundRequest, body: Body) -> Result<Response<Incoming>, UpstreamError> {
        let addr = outbound.addr();
        let scheme = outbound.scheme;
        let host = outbound.host.clone();

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), outbound.port)))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(addr.clone()))?
            .map_err(|source| UpstreamError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true).ok();

        let request = outbound.into_request(body);
        match scheme {
            UpstreamScheme::Http => self.exchange(stream, request, &addr).await,
            UpstreamScheme::Https => {
                let server_name =
                    ServerName::try_from(host.clone()).map_err(|_| UpstreamError::ServerName(host.clone()))?;
                let stream = tokio::time::timeout(self.connect_timeout, self.tls.connect(server_name, stream))
                    .await
                    .map_err(|_| UpstreamError::ConnectTimeout(addr.clone()))?
                    .map_err(|source| UpstreamError::Tls { host, source })?;
                self.exchange(stream, request, &addr).await
            }
        }
    }

    async fn exchange<S>(&self, io: S, request: Request<Body>, addr: &str) -> Result<Response<Incoming>, UpstreamError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(UpstreamError::Handshake)?;
        let peer = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(upstream = %peer, error = %e, "Upstream connection closed with error");
            }
        });

        tokio::time::timeout(self.response_timeout, sender.send_request(request))
            .await
            .map_err(|_| UpstreamError::ResponseTimeout(addr.to_string()))?
            .map_err(UpstreamError::Request)
    }
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}
