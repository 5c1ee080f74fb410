// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection accounting.

use crate::core::metrics;
use std::net::SocketAddr;
use tracing::debug;

/// Counts a session as connected for exactly as long as the guard is alive, so the
/// gauge stays correct however the handler exits.
pub struct ConnectionGuard {
    session_id: u64,
    addr: SocketAddr,
}

impl ConnectionGuard {
    pub(crate) fn new(session_id: u64, addr: SocketAddr) -> Self {
        metrics::CONNECTED_CLIENTS.inc();
        Self { session_id, addr }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_CLIENTS.dec();
        debug!(
            "Session {}: connection from {} released",
            self.session_id, self.addr
        );
    }
}
