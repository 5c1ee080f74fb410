// src/server/connection_loop.rs

//! Contains the accept loop, credential reloads, and graceful shutdown.

use super::context::ServerContext;
use super::stream::ClientStream;
use crate::connection::ConnectionHandler;
use crate::core::credentials::load_credentials_file;
use crate::core::metrics;
use crate::core::protocol::RespFrame;
use crate::core::state::GatewayState;
use anyhow::{Result, anyhow};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{OwnedSemaphorePermit, broadcast};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for client sessions before aborting them.
const CLIENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The accept loop. Runs until SIGINT, SIGTERM, or a failed background task.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut session_id_counter: u64 = 0;
    let mut client_tasks = JoinSet::new();

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow!("Failed to register SIGHUP handler: {}", e))?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading credentials.");
                if let Err(e) = reload_credentials(&ctx.state).await {
                    error!("Credential reload failed, keeping the previous credentials: {:#}", e);
                }
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                let (socket, addr) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                debug!("Accepted new connection from: {}", addr);
                metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                }

                // Acquired before spawning so that the limit holds even while TLS
                // handshakes are still pending.
                let permit = ctx.connection_permits.clone().try_acquire_owned().ok();

                session_id_counter = session_id_counter.wrapping_add(1);
                let session_id = session_id_counter;
                let state = ctx.state.clone();
                let shutdown_rx = ctx.shutdown_tx.subscribe();
                let acceptor = ctx.acceptor.clone();

                client_tasks.spawn(async move {
                    serve_connection(socket, addr, acceptor, permit, state, session_id, shutdown_rx).await;
                });
            },

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        debug!("No task was listening for the shutdown signal.");
    }

    if tokio::time::timeout(CLIENT_DRAIN_TIMEOUT, async {
        while client_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for client sessions to close; aborting the rest.");
        client_tasks.shutdown().await;
    }
    info!("All client connections closed.");

    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Gateway shutdown complete.");
    Ok(())
}

/// Completes TLS if configured, then either runs the session or turns the client away
/// when no connection permit was available.
async fn serve_connection(
    socket: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    permit: Option<OwnedSemaphorePermit>,
    state: Arc<GatewayState>,
    session_id: u64,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let stream = match acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls_stream) => {
                debug!("TLS handshake successful for {addr}");
                ClientStream::Tls(Box::new(tls_stream))
            }
            Err(e) => {
                warn!("TLS handshake error for {addr}: {e}");
                return;
            }
        },
        None => ClientStream::Tcp(socket),
    };

    let Some(_permit) = permit else {
        reject_over_limit(stream, addr).await;
        return;
    };

    debug!(
        "Session {} for {} starting (tls: {}).",
        session_id,
        addr,
        stream.is_tls()
    );
    let handler = ConnectionHandler::new(stream, addr, state, session_id, shutdown_rx);
    if let Err(e) = handler.run().await {
        debug!("Connection from {} terminated with error: {}", addr, e);
    }
}

async fn reject_over_limit(mut stream: ClientStream, addr: SocketAddr) {
    warn!("Rejecting connection from {}: max number of clients reached.", addr);
    metrics::CONNECTIONS_REJECTED_TOTAL.inc();
    let Ok(reply) = RespFrame::Error("ERR max number of clients reached".into()).encode_to_vec()
    else {
        return;
    };
    let write = async {
        stream.write_all(&reply).await?;
        stream.shutdown().await
    };
    if let Ok(Err(e)) = tokio::time::timeout(Duration::from_secs(1), write).await {
        debug!("Could not deliver rejection to {}: {}", addr, e);
    }
}

/// Re-reads the configured credentials file and swaps it in whole. On any error the
/// active snapshot is left untouched.
pub async fn reload_credentials(state: &GatewayState) -> Result<usize> {
    let Some(path) = &state.config.credentials_file else {
        warn!("No credentials_file configured; nothing to reload.");
        metrics::CREDENTIAL_RELOADS_TOTAL
            .with_label_values(&["skipped"])
            .inc();
        return Ok(state.credentials.len());
    };

    match load_credentials_file(path).await {
        Ok(snapshot) => {
            let count = snapshot.len();
            state.credentials.replace(snapshot);
            metrics::CREDENTIALS_LOADED.set(count as f64);
            metrics::CREDENTIAL_RELOADS_TOTAL
                .with_label_values(&["ok"])
                .inc();
            info!("Reloaded {} tenant credential(s) from '{}'.", count, path);
            Ok(count)
        }
        Err(e) => {
            metrics::CREDENTIAL_RELOADS_TOTAL
                .with_label_values(&["error"])
                .inc();
            Err(e)
        }
    }
}
