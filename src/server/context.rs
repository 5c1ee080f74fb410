// src/server/context.rs

use crate::core::state::GatewayState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

/// Holds all the initialized state required to run the gateway's accept loop.
pub struct ServerContext {
    pub state: Arc<GatewayState>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    pub acceptor: Option<TlsAcceptor>,
    /// One permit per concurrent session, `max_clients` in total.
    pub connection_permits: Arc<Semaphore>,
}
