//! SSL-stripping forwarding proxy library.
//!
//! Relays plaintext HTTP, rewrites `https://` links in HTML responses to
//! `http://`, remembers which resources were downgraded so later requests
//! for them go upstream over TLS, and tunnels CONNECT traffic untouched.
//! For lab and authorized security testing.

pub mod config;
pub mod downgrade;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use downgrade::DowngradeTable;
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
