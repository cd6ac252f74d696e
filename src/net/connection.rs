//! Connection identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live client connections and tunnels

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How a connection is being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Plaintext HTTP, forwarded and possibly rewritten.
    Http,
    /// Opaque CONNECT relay.
    Tunnel,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tunnel => "tunnel",
        }
    }
}

/// Counts live connections by kind.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    http: Arc<AtomicU64>,
    tunnels: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new live connection. The returned guard decrements on drop.
    pub fn track(&self, kind: ConnectionKind) -> ConnectionGuard {
        let counter = match kind {
            ConnectionKind::Http => &self.http,
            ConnectionKind::Tunnel => &self.tunnels,
        };
        let active = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(kind.as_str(), active);
        ConnectionGuard {
            counter: Arc::clone(counter),
            id: ConnectionId::new(),
            kind,
        }
    }

    pub fn active_http(&self) -> u64 {
        self.http.load(Ordering::SeqCst)
    }

    pub fn active_tunnels(&self) -> u64 {
        self.tunnels.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicU64>,
    id: ConnectionId,
    kind: ConnectionKind,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_connections(self.kind.as_str(), active);
        tracing::trace!(connection_id = %self.id, kind = ?self.kind, "Connection closed");
    }
}
