//! Request-head sniffing for protocol dispatch.
//!
//! Only the method token is needed to route a connection. `CONNECT`
//! heads are then read in full; every other request is left in the buffer
//! for the HTTP server to parse.

use tokio::io::AsyncRead;

use crate::net::prebuffered::Prebuffered;

/// Longest method token worth waiting for.
const MAX_METHOD_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("client closed the connection before sending a request")]
    Closed,
    #[error("request head exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("CONNECT request without a target")]
    MissingTarget,
    #[error("io error reading request head")]
    Io(#[from] std::io::Error),
}

/// What the first request on a connection asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestHead {
    /// A tunnel request; `head_len` bytes of the buffer hold the head.
    Connect { target: String, head_len: usize },
    /// Anything else, still unconsumed in the buffer.
    Http,
}

/// Inspect the start of a connection without consuming ordinary requests.
pub async fn sniff_head<S>(reader: &mut Prebuffered<S>, limit: usize) -> Result<RequestHead, HeadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        let buf = reader.buffer();
        if let Some(space) = buf.iter().position(|b| *b == b' ') {
            if &buf[..space] != b"CONNECT" {
                return Ok(RequestHead::Http);
            }
            break;
        }
        if buf.len() > MAX_METHOD_LEN {
            return Ok(RequestHead::Http);
        }
        if reader.buffer_more().await? == 0 {
            return if reader.buffer().is_empty() {
                Err(HeadError::Closed)
            } else {
                // Let the HTTP server report the truncated request.
                Ok(RequestHead::Http)
            };
        }
    }

    loop {
        if let Some(head) = parse_connect(reader.buffer())? {
            return Ok(head);
        }
        if reader.is_full() {
            return Err(HeadError::TooLarge { limit });
        }
        if reader.buffer_more().await? == 0 {
            return Err(HeadError::Closed);
        }
    }
}

/// Parse a complete CONNECT head, or `None` when more bytes are needed.
fn parse_connect(buf: &[u8]) -> Result<Option<RequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(head_len) => {
            let target = req.path.filter(|p| !p.is_empty()).ok_or(HeadError::MissingTarget)?;
            Ok(Some(RequestHead::Connect {
                target: target.to_string(),
                head_len,
            }))
        }
    }
}
