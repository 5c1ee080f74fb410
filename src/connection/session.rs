// src/connection/session.rs

//! Defines the state associated with a single client session.

use crate::core::dialer::UpstreamStream;
use crate::core::protocol::RawCommand;
use bytes::Bytes;
use std::fmt;
use tokio::io::BufReader;

/// The handshake phase of a session. Each phase carries exactly the data the next
/// transition needs.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    /// Waiting for the client's first command.
    AwaitingClientAuth,
    /// The client's first command is being forwarded and its reply awaited.
    /// `secret` is present only when that command is an `AUTH`.
    UpstreamAuthInFlight {
        command: RawCommand,
        secret: Option<Bytes>,
    },
    /// The hidden `SELECT` for the tenant's database is in flight.
    TenantSelectInFlight { db_index: String },
    /// Bytes are copied verbatim in both directions.
    Relaying,
    /// Terminal.
    Closed,
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::AwaitingClientAuth => "awaiting client auth",
            SessionPhase::UpstreamAuthInFlight { .. } => "upstream auth in flight",
            SessionPhase::TenantSelectInFlight { .. } => "tenant select in flight",
            SessionPhase::Relaying => "relaying",
            SessionPhase::Closed => "closed",
        }
    }

    /// True until the session has been handed to the relay.
    pub fn is_handshake(&self) -> bool {
        !matches!(self, SessionPhase::Relaying | SessionPhase::Closed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Holds the state specific to a single client session.
pub struct Session<S> {
    /// The client connection. Buffered so that a command is read exactly to its end;
    /// anything the client pipelined behind it stays in the buffer for the relay.
    pub client: BufReader<S>,
    /// The upstream connection, absent until the client's first command has arrived.
    pub upstream: Option<BufReader<UpstreamStream>>,
    pub phase: SessionPhase,
    /// The tenant database the upstream connection is pinned to, once selected.
    pub db_index: Option<String>,
}

impl<S> Session<S> {
    pub(crate) fn new(client: BufReader<S>) -> Self {
        Self {
            client,
            upstream: None,
            phase: SessionPhase::AwaitingClientAuth,
            db_index: None,
        }
    }

    /// Moves the current phase out, leaving `Closed` behind until the next transition.
    pub(crate) fn take_phase(&mut self) -> SessionPhase {
        std::mem::replace(&mut self.phase, SessionPhase::Closed)
    }
}

/// Extracts the password from an `AUTH` command.
///
/// Both `AUTH <password>` and `AUTH <username> <password>` are recognized; any other
/// arity is still forwarded upstream but carries no usable secret.
pub fn auth_secret(command: &RawCommand) -> Option<Bytes> {
    if !command.is("AUTH") {
        return None;
    }
    match command.arg_count() {
        2 => command.arg(1).map(Bytes::copy_from_slice),
        3 => command.arg(2).map(Bytes::copy_from_slice),
        _ => None,
    }
}
