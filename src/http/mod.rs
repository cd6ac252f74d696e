//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! plaintext client connection
//!     → server.rs (accept, CONNECT vs HTTP dispatch, hyper + Axum)
//!     → forward.rs (scheme decision, outbound descriptor, redirects)
//!     → upstream.rs (plaintext or TLS origin connection)
//!     → rewrite.rs + codec.rs (HTML only: decode, downgrade links, encode)
//!     → Send to client
//! ```

pub mod codec;
pub mod forward;
pub mod rewrite;
pub mod server;
pub mod upstream;

pub use codec::ContentCoding;
pub use forward::{ProxyState, PROXY_FETCH_FAILED};
pub use rewrite::{ContentRewriter, RewriteError};
pub use server::{ProxyServer, ServerError};
pub use upstream::{ForwardError, OutboundRequest, UpstreamConnector, UpstreamError, UpstreamScheme};
