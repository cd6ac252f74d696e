//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (connection id, live counts)
//!     → prebuffered.rs + head.rs (read ahead until the method is known)
//!         ├─ CONNECT → tunnel.rs (literal 200, opaque relay)
//!         └─ other   → hand off to HTTP layer, bytes intact
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Only CONNECT heads are consumed here; HTTP parsing belongs to hyper
//! - Tunnels never see plaintext and never touch the downgrade table

pub mod connection;
pub mod head;
pub mod listener;
pub mod prebuffered;
pub mod tunnel;
