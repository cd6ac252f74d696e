//! Downgrade tracking subsystem.
//!
//! # Data Flow
//! ```text
//! Writers:
//!     http/forward.rs  (secure Location redirect targets)
//!     http/rewrite.rs  (secure links found in HTML bodies)
//!         → table.rs record_secure_link(url)
//!
//! Reader:
//!     http/forward.rs  should_use_secure_scheme(host, path)
//!         → decides plaintext vs TLS for the upstream request
//! ```
//!
//! # Design Decisions
//! - Keys are `hostname + path`: scheme, port, query and fragment are dropped
//! - The decision is per path, never per host
//! - Append-only: entries are never evicted for the process lifetime
//! - One shared handle per proxy instance, not a global

pub mod table;

pub use table::{downgrade_key, DowngradeTable};
