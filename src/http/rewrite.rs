//! HTML rewriting: secure links become plaintext links.
//!
//! # Responsibilities
//! - Decide which responses are rewritten (`Content-Type` containing `html`)
//! - Decode, buffer, rewrite and re-encode the body
//! - Feed every rewritten link into the downgrade table
//!
//! # Design Decisions
//! - The whole body is buffered since a link may straddle chunk boundaries
//! - Headers go out before the body is read; a decode failure becomes a
//!   body stream error and the client sees a truncated response
//! - `Content-Length` is always dropped; the new length is not computed

use std::sync::LazyLock;

use axum::body::{Body, BodyDataStream};
use axum::http::{header, HeaderMap, Response};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use regex::bytes::{Captures, Regex};

use crate::downgrade::DowngradeTable;
use crate::http::codec::ContentCoding;
use crate::observability::metrics;

/// A double-quoted `https://` URL made only of URL-safe characters.
static SECURE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(https://[A-Za-z0-9_:#@%/;$()~?+\-=\\.&]*)""#).expect("secure link pattern is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("failed to read upstream body")]
    Body(#[from] axum::Error),
    #[error("failed to decode {coding} body")]
    Decode {
        coding: ContentCoding,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {coding} body")]
    Encode {
        coding: ContentCoding,
        #[source]
        source: std::io::Error,
    },
}

/// Whether a response body should go through the rewriter.
pub fn is_rewritable(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("html"))
}

/// Rewrites secure links in HTML responses.
#[derive(Debug, Clone)]
pub struct ContentRewriter {
    downgrades: DowngradeTable,
    max_body_bytes: Option<usize>,
}

impl ContentRewriter {
    pub fn new(downgrades: DowngradeTable, max_body_bytes: Option<usize>) -> Self {
        Self {
            downgrades,
            max_body_bytes,
        }
    }

    /// Replace the body of an HTML response with its rewritten form.
    ///
    /// Status and every header except `Content-Length` are kept.
    pub fn rewrite_response(&self, response: Response<Body>) -> Response<Body> {
        let (mut parts, body) = response.into_parts();
        parts.headers.remove(header::CONTENT_LENGTH);
        let coding = ContentCoding::from_headers(&parts.headers);

        let rewriter = self.clone();
        let rewritten = stream::once(async move { rewriter.rewrite_body(body, coding).await }).flatten();
        Response::from_parts(parts, Body::from_stream(rewritten))
    }

    async fn rewrite_body(
        self,
        body: Body,
        coding: ContentCoding,
    ) -> BoxStream<'static, Result<Bytes, RewriteError>> {
        let mut chunks = body.into_data_stream();
        let raw = match buffer_body(&mut chunks, self.max_body_bytes).await {
            Ok(Buffered::Complete(raw)) => raw,
            Ok(Buffered::Overflow(head)) => {
                tracing::warn!(
                    limit = ?self.max_body_bytes,
                    "HTML body exceeds rewrite limit, passing through unmodified"
                );
                return stream::once(async move { Ok(head) })
                    .chain(chunks.map_err(RewriteError::from))
                    .boxed();
            }
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let result = self.rewrite_encoded(&raw, coding);
        if let Err(e) = &result {
            tracing::warn!(error = %e, coding = %coding, "HTML rewrite failed");
        }
        stream::once(async move { result }).boxed()
    }

    fn rewrite_encoded(&self, raw: &[u8], coding: ContentCoding) -> Result<Bytes, RewriteError> {
        if raw.is_empty() {
            return Ok(Bytes::new());
        }
        let html = coding
            .decode(raw)
            .map_err(|source| RewriteError::Decode { coding, source })?;
        let stripped = self.strip_links(&html);
        let encoded = coding
            .encode(&stripped)
            .map_err(|source| RewriteError::Encode { coding, source })?;
        Ok(Bytes::from(encoded))
    }

    /// Downgrade every quoted `https://` link in `html` and record it.
    pub fn strip_links(&self, html: &[u8]) -> Vec<u8> {
        let mut rewritten = 0usize;
        let out = SECURE_LINK.replace_all(html, |caps: &Captures<'_>| {
            if let Ok(link) = std::str::from_utf8(&caps[1]) {
                self.downgrades.record_secure_link(link);
            }
            rewritten += 1;
            let quoted = &caps[0];
            let mut replacement = Vec::with_capacity(quoted.len() - 1);
            replacement.extend_from_slice(b"\"http");
            replacement.extend_from_slice(&quoted[b"\"https".len()..]);
            replacement
        });
        if rewritten > 0 {
            tracing::debug!(links = rewritten, "Rewrote secure links");
            metrics::record_links_rewritten(rewritten);
        }
        out.into_owned()
    }
}

enum Buffered {
    Complete(Bytes),
    /// The limit was crossed; holds everything read so far.
    Overflow(Bytes),
}

async fn buffer_body(chunks: &mut BodyDataStream, limit: Option<usize>) -> Result<Buffered, RewriteError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = chunks.next().await {
        buf.extend_from_slice(&chunk?);
        if limit.is_some_and(|limit| buf.len() > limit) {
            return Ok(Buffered::Overflow(buf.freeze()));
        }
    }
    Ok(Buffered::Complete(buf.freeze()))
}
