// src/connection/handler.rs

//! Defines the `ConnectionHandler`, which drives one client session from its first
//! command through the hidden tenant `SELECT` and into the byte relay.

use super::guard::ConnectionGuard;
use super::session::{Session, SessionPhase, auth_secret};
use crate::core::metrics;
use crate::core::protocol::frame_reader::MAX_LINE_LENGTH;
use crate::core::protocol::{RawCommand, RawReply, RespFrame, read_command, read_reply};
use crate::core::relay::{RelayEnd, relay};
use crate::core::state::GatewayState;
use crate::core::{GatewayError, UpstreamStream};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Manages the full lifecycle of a client session.
pub struct ConnectionHandler<S> {
    session: Session<S>,
    addr: SocketAddr,
    state: Arc<GatewayState>,
    session_id: u64,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates a new `ConnectionHandler`. No upstream connection is made here.
    pub fn new(
        socket: S,
        addr: SocketAddr,
        state: Arc<GatewayState>,
        session_id: u64,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            session: Session::new(BufReader::new(socket)),
            addr,
            state,
            session_id,
            shutdown_rx,
        }
    }

    /// Runs the session to completion. A shutdown signal ends the session cleanly;
    /// every other failure is returned after the client has been told, if it is owed
    /// a reply, and both connections have been released.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let _guard = ConnectionGuard::new(self.session_id, self.addr);
        loop {
            let phase = self.session.take_phase();
            debug!("Session {}: entering phase '{}'", self.session_id, phase);
            let was_handshake = phase.is_handshake();

            let result = match phase {
                SessionPhase::AwaitingClientAuth => self.await_client_auth().await,
                SessionPhase::UpstreamAuthInFlight { command, secret } => {
                    self.forward_first_command(command, secret).await
                }
                SessionPhase::TenantSelectInFlight { db_index } => {
                    self.select_tenant_db(db_index).await
                }
                SessionPhase::Relaying => self.relay().await,
                SessionPhase::Closed => return Ok(()),
            };

            match result {
                Ok(next) => self.session.phase = next,
                Err(GatewayError::ShuttingDown) => {
                    info!("Session {} for {} closed by shutdown.", self.session_id, self.addr);
                    return Ok(());
                }
                Err(e) => {
                    if was_handshake {
                        metrics::HANDSHAKES_TOTAL
                            .with_label_values(&["failed"])
                            .inc();
                    }
                    self.report_failure(&e).await;
                    return Err(e);
                }
            }
        }
    }

    /// Reads the client's first command. Nothing is dialed until it is complete.
    ///
    /// Blank lines and empty arrays get no reply from the upstream, so they are not
    /// treated as the first command. Their bytes are kept and sent in front of it.
    async fn await_client_auth(&mut self) -> Result<SessionPhase, GatewayError> {
        let mut skipped = BytesMut::new();
        let command = loop {
            let next =
                until_shutdown(&mut self.shutdown_rx, read_command(&mut self.session.client))
                    .await?;
            let Some(command) = next else {
                debug!("Session {}: client closed before sending a command", self.session_id);
                return Ok(SessionPhase::Closed);
            };
            if !command.is_empty() {
                break command.with_prefix(&skipped);
            }
            if skipped.len() + command.as_bytes().len() > MAX_LINE_LENGTH {
                return Err(GatewayError::Protocol(
                    "too many empty commands before the first command".into(),
                ));
            }
            skipped.extend_from_slice(command.as_bytes());
        };

        let secret = auth_secret(&command);
        if secret.is_none() {
            debug!(
                "Session {}: first command '{}' is not AUTH; it will be passed through unpinned",
                self.session_id,
                String::from_utf8_lossy(command.name().unwrap_or_default())
            );
        }
        Ok(SessionPhase::UpstreamAuthInFlight { command, secret })
    }

    /// Dials the upstream, forwards the first command verbatim and hands the reply
    /// back to the client verbatim, whatever it says.
    async fn forward_first_command(
        &mut self,
        command: RawCommand,
        secret: Option<Bytes>,
    ) -> Result<SessionPhase, GatewayError> {
        self.ensure_upstream().await?;

        let timeout = self.state.handshake_timeout();
        let upstream = connected(&mut self.session.upstream)?;
        let reply = until_shutdown(
            &mut self.shutdown_rx,
            with_timeout(
                timeout,
                "waiting for the upstream AUTH reply",
                round_trip(upstream, command.as_bytes()),
            ),
        )
        .await?;

        self.session.client.write_all(reply.as_bytes()).await?;
        self.session.client.flush().await?;

        let Some(secret) = secret else {
            metrics::HANDSHAKES_TOTAL
                .with_label_values(&["passthrough"])
                .inc();
            return Ok(SessionPhase::Relaying);
        };

        if !reply.is_ok() {
            info!(
                "Session {}: upstream rejected AUTH from {} ({})",
                self.session_id,
                self.addr,
                reply.summary()
            );
            metrics::HANDSHAKES_TOTAL
                .with_label_values(&["rejected"])
                .inc();
            return Ok(SessionPhase::Closed);
        }

        match self.state.credentials.lookup(&secret) {
            Some(db_index) => Ok(SessionPhase::TenantSelectInFlight { db_index }),
            None => {
                debug!(
                    "Session {}: authenticated secret has no tenant mapping; using the default database",
                    self.session_id
                );
                metrics::HANDSHAKES_TOTAL
                    .with_label_values(&["unmapped"])
                    .inc();
                Ok(SessionPhase::Relaying)
            }
        }
    }

    /// Pins the upstream connection to the tenant's database. The reply is consumed
    /// here and never reaches the client; anything but `+OK` ends the session.
    async fn select_tenant_db(&mut self, db_index: String) -> Result<SessionPhase, GatewayError> {
        let select = RespFrame::command([Bytes::from_static(b"SELECT"), Bytes::from(db_index.clone())])
            .encode_to_vec()?;

        let timeout = self.state.handshake_timeout();
        let upstream = connected(&mut self.session.upstream)?;
        let reply = until_shutdown(
            &mut self.shutdown_rx,
            with_timeout(
                timeout,
                "waiting for the tenant SELECT reply",
                round_trip(upstream, &select),
            ),
        )
        .await
        .map_err(|e| match e {
            GatewayError::ShuttingDown => e,
            other => GatewayError::TenantSelectFailed(other.to_string()),
        })?;

        if !reply.is_ok() {
            return Err(GatewayError::TenantSelectFailed(format!(
                "SELECT {db_index} answered with '{}'",
                reply.summary()
            )));
        }

        debug!("Session {}: pinned to database {}", self.session_id, db_index);
        self.session.db_index = Some(db_index);
        metrics::HANDSHAKES_TOTAL
            .with_label_values(&["pinned"])
            .inc();
        Ok(SessionPhase::Relaying)
    }

    /// Hands both connections to the relay for the rest of the session.
    async fn relay(&mut self) -> Result<SessionPhase, GatewayError> {
        let upstream = connected(&mut self.session.upstream)?;

        let summary = relay(&mut self.session.client, upstream, &mut self.shutdown_rx).await?;
        match summary.ended_by {
            RelayEnd::Shutdown => return Err(GatewayError::ShuttingDown),
            RelayEnd::ClientClosed => debug!("Session {}: client closed", self.session_id),
            RelayEnd::UpstreamClosed => debug!("Session {}: upstream closed", self.session_id),
        }
        info!(
            "Session {} for {} finished (db {}): {} bytes to upstream, {} bytes to client.",
            self.session_id,
            self.addr,
            self.session.db_index.as_deref().unwrap_or("default"),
            summary.client_to_upstream,
            summary.upstream_to_client
        );
        Ok(SessionPhase::Closed)
    }

    /// Opens the session's single upstream connection if it is not open yet.
    async fn ensure_upstream(&mut self) -> Result<(), GatewayError> {
        if self.session.upstream.is_some() {
            return Ok(());
        }
        let state = Arc::clone(&self.state);
        let dialed = until_shutdown(
            &mut self.shutdown_rx,
            state
                .dialer
                .dial(state.upstream_network(), state.upstream_address()),
        )
        .await;

        match dialed {
            Ok(stream) => {
                debug!(
                    "Session {}: connected to upstream {}",
                    self.session_id,
                    state.upstream_address()
                );
                self.session.upstream = Some(BufReader::new(stream));
                Ok(())
            }
            Err(e) => {
                if !matches!(e, GatewayError::ShuttingDown) {
                    metrics::UPSTREAM_DIAL_FAILURES_TOTAL.inc();
                }
                Err(e)
            }
        }
    }

    /// Logs a failed session and sends the client the one error reply it is owed, if any.
    async fn report_failure(&mut self, e: &GatewayError) {
        warn!(
            "Session {} for {} failed: {}",
            self.session_id, self.addr, e
        );
        let Some(message) = e.client_reply() else {
            return;
        };
        let Ok(reply) = RespFrame::Error(message).encode_to_vec() else {
            return;
        };
        let write = async {
            self.session.client.write_all(&reply).await?;
            self.session.client.flush().await
        };
        if let Err(write_err) = tokio::time::timeout(Duration::from_secs(1), write)
            .await
            .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
        {
            debug!(
                "Session {}: could not deliver error reply: {}",
                self.session_id, write_err
            );
        }
    }
}

fn connected(
    upstream: &mut Option<BufReader<UpstreamStream>>,
) -> Result<&mut BufReader<UpstreamStream>, GatewayError> {
    upstream
        .as_mut()
        .ok_or_else(|| GatewayError::Internal("upstream not connected".into()))
}

/// Writes one request to the upstream and reads exactly one reply.
async fn round_trip<U>(upstream: &mut BufReader<U>, request: &[u8]) -> Result<RawReply, GatewayError>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    upstream
        .write_all(request)
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("write failed: {e}")))?;
    upstream
        .flush()
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("flush failed: {e}")))?;
    read_reply(upstream).await?.ok_or_else(|| {
        GatewayError::UpstreamUnavailable("upstream closed the connection".into())
    })
}

/// Bounds `fut` by the handshake timeout when one is configured.
async fn with_timeout<F, T>(
    timeout: Option<Duration>,
    what: &'static str,
    fut: F,
) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| GatewayError::HandshakeTimeout(what))?,
        None => fut.await,
    }
}

/// Runs `fut` unless the process-wide shutdown signal fires first.
async fn until_shutdown<F, T>(
    shutdown_rx: &mut broadcast::Receiver<()>,
    fut: F,
) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    tokio::select! {
        biased;
        Ok(()) = shutdown_rx.recv() => Err(GatewayError::ShuttingDown),
        res = fut => res,
    }
}
