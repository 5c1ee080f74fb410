// src/core/errors.rs

//! Defines the primary error type for the gateway.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every way a session can fail.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// Malformed or truncated framing while reading a client command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The upstream server could not be reached.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream sent a reply that could not be framed.
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// A read or write failed on either side while relaying.
    #[error("Relay IO error: {0}")]
    RelayIo(String),

    /// A handshake round-trip exceeded the configured bound.
    #[error("Handshake timed out while {0}")]
    HandshakeTimeout(&'static str),

    /// The hidden database selection for a tenant did not succeed.
    #[error("Tenant database selection failed: {0}")]
    TenantSelectFailed(String),

    /// The process-wide shutdown signal interrupted the session.
    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The error reply sent to the client when this error is surfaced before closing,
    /// or `None` when the session should close silently.
    ///
    /// Only failures to reach the upstream are ever reported; everything else the
    /// client sees comes verbatim from the upstream.
    pub fn client_reply(&self) -> Option<String> {
        match self {
            GatewayError::UpstreamUnavailable(_) => {
                Some("ERR upstream unavailable".to_string())
            }
            GatewayError::HandshakeTimeout(_) => Some("ERR upstream timed out".to_string()),
            _ => None,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for GatewayError {
    fn clone(&self) -> Self {
        match self {
            GatewayError::Io(e) => GatewayError::Io(Arc::clone(e)),
            GatewayError::Protocol(s) => GatewayError::Protocol(s.clone()),
            GatewayError::UpstreamUnavailable(s) => GatewayError::UpstreamUnavailable(s.clone()),
            GatewayError::UpstreamProtocol(s) => GatewayError::UpstreamProtocol(s.clone()),
            GatewayError::RelayIo(s) => GatewayError::RelayIo(s.clone()),
            GatewayError::HandshakeTimeout(s) => GatewayError::HandshakeTimeout(s),
            GatewayError::TenantSelectFailed(s) => GatewayError::TenantSelectFailed(s.clone()),
            GatewayError::ShuttingDown => GatewayError::ShuttingDown,
            GatewayError::Internal(s) => GatewayError::Internal(s.clone()),
        }
    }
}

impl PartialEq for GatewayError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (GatewayError::Io(e1), GatewayError::Io(e2)) => e1.to_string() == e2.to_string(),
            (GatewayError::Protocol(s1), GatewayError::Protocol(s2)) => s1 == s2,
            (GatewayError::UpstreamUnavailable(s1), GatewayError::UpstreamUnavailable(s2)) => {
                s1 == s2
            }
            (GatewayError::UpstreamProtocol(s1), GatewayError::UpstreamProtocol(s2)) => s1 == s2,
            (GatewayError::RelayIo(s1), GatewayError::RelayIo(s2)) => s1 == s2,
            (GatewayError::HandshakeTimeout(s1), GatewayError::HandshakeTimeout(s2)) => s1 == s2,
            (GatewayError::TenantSelectFailed(s1), GatewayError::TenantSelectFailed(s2)) => {
                s1 == s2
            }
            (GatewayError::Internal(s1), GatewayError::Internal(s2)) => s1 == s2,
            (GatewayError::ShuttingDown, GatewayError::ShuttingDown) => true,
            _ => false,
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(Arc::new(e))
    }
}

impl From<String> for GatewayError {
    fn from(s: String) -> Self {
        GatewayError::Internal(s)
    }
}
