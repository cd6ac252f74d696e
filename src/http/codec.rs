//! Content codings understood by the rewriter.

use std::io::{self, Read, Write};

use axum::http::{header, HeaderMap};
use flate2::read::{DeflateDecoder, MultiGzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

/// The `Content-Encoding` of an upstream body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    /// Raw deflate, no zlib wrapper.
    Deflate,
}

impl ContentCoding {
    /// Pick the coding from response headers; unknown codings pass through.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(value) = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
        else {
            return Self::Identity;
        };
        let value = value.trim();
        if value.eq_ignore_ascii_case("gzip") {
            Self::Gzip
        } else if value.eq_ignore_ascii_case("deflate") {
            Self::Deflate
        } else {
            Self::Identity
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    /// Decode `raw`. An empty body decodes to nothing under every coding.
    pub fn decode(self, raw: &[u8]) -> io::Result<Vec<u8>> {
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(raw.len() * 2);
        match self {
            Self::Identity => out.extend_from_slice(raw),
            Self::Gzip => {
                MultiGzDecoder::new(raw).read_to_end(&mut out)?;
            }
            Self::Deflate => {
                DeflateDecoder::new(raw).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }

    pub fn encode(self, plain: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(plain.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(plain)?;
                encoder.finish()
            }
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(plain)?;
                encoder.finish()
            }
        }
    }
}

impl std::fmt::Display for ContentCoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
