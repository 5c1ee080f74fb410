// tests/integration/test_helpers.rs

//! Test helpers for gateway integration tests: a scriptable mock upstream, an
//! in-process gateway bound to an ephemeral port, and a RESP test client.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use respgate::config::Config;
use respgate::connection::ConnectionHandler;
use respgate::core::protocol::{RespFrame, RespFrameCodec};
use respgate::core::state::GatewayState;
use respgate::core::{
    CredentialEntry, CredentialSnapshot, CredentialStore, Dialer, GatewayError, UpstreamDialer,
    UpstreamStream,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, duplex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// How long a test client waits for a reply before failing the test.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sets up minimal tracing for tests (ignored if already initialized).
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Builds a credential snapshot from `(secret, db_index)` pairs.
pub fn credentials(pairs: &[(&str, &str)]) -> CredentialSnapshot {
    pairs
        .iter()
        .map(|(secret, db)| {
            (
                secret.to_string(),
                CredentialEntry {
                    db_index: db.to_string(),
                },
            )
        })
        .collect()
}

/// How the mock upstream answers the commands the gateway cares about.
#[derive(Clone, Default)]
pub struct MockBehavior {
    /// Passwords accepted by `AUTH`. `None` accepts any password.
    pub passwords: Option<Vec<String>>,
    /// When set, every `SELECT` is answered with this error instead of `+OK`.
    pub select_error: Option<String>,
    /// Delay before answering `AUTH`.
    pub auth_delay: Option<Duration>,
}

/// State shared by every connection the mock upstream serves.
#[derive(Default)]
struct MockShared {
    behavior: MockBehavior,
    log: Mutex<Vec<Vec<Vec<String>>>>,
    closed: AtomicUsize,
    keyspace: Mutex<HashMap<(i64, String), String>>,
}

impl MockShared {
    /// Registers a new connection and returns its index in the log.
    fn open_connection(&self) -> usize {
        let mut log = self.log.lock();
        log.push(Vec::new());
        log.len() - 1
    }
}

/// A tiny Redis-like server: AUTH, SELECT, PING, ECHO, SET, GET and QUIT, with one
/// keyspace per database index shared across connections.
pub struct MockUpstream {
    pub addr: SocketAddr,
    shared: Arc<MockShared>,
    handle: Option<JoinHandle<()>>,
}

impl MockUpstream {
    /// Serves the mock on an ephemeral TCP port.
    pub async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(MockShared {
            behavior,
            ..Default::default()
        });

        let handle = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let conn_id = shared.open_connection();
                    tokio::spawn(serve_mock_connection(socket, conn_id, shared.clone()));
                }
            })
        };

        Self {
            addr,
            shared,
            handle: Some(handle),
        }
    }

    /// Serves the mock over in-memory pipes. Every dial of the returned dialer opens
    /// a new mock connection; no socket is ever created.
    pub fn in_memory(behavior: MockBehavior) -> (Self, Arc<InMemoryDialer>) {
        let shared = Arc::new(MockShared {
            behavior,
            ..Default::default()
        });
        let dialer = Arc::new(InMemoryDialer {
            shared: shared.clone(),
            dials: AtomicUsize::new(0),
        });
        let upstream = Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            shared,
            handle: None,
        };
        (upstream, dialer)
    }

    /// Commands received on each upstream connection, in arrival order.
    pub fn commands(&self) -> Vec<Vec<Vec<String>>> {
        self.shared.log.lock().clone()
    }

    /// Commands received on the only upstream connection.
    pub fn single_connection_commands(&self) -> Vec<Vec<String>> {
        let log = self.commands();
        assert_eq!(log.len(), 1, "expected exactly one upstream connection");
        log[0].clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.log.lock().len()
    }

    pub fn closed_connections(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Waits until the mock has seen `n` of its connections closed.
    pub async fn wait_for_closed(&self, n: usize) -> bool {
        tokio::time::timeout(REPLY_TIMEOUT, async {
            while self.closed_connections() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// A dialer whose upstream is the mock at the other end of a `tokio::io::duplex` pipe.
pub struct InMemoryDialer {
    shared: Arc<MockShared>,
    dials: AtomicUsize,
}

impl InMemoryDialer {
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for InMemoryDialer {
    async fn dial(&self, _network: &str, _address: &str) -> Result<UpstreamStream, GatewayError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (gateway_side, mock_side) = duplex(64 * 1024);
        let conn_id = self.shared.open_connection();
        tokio::spawn(serve_mock_connection(mock_side, conn_id, self.shared.clone()));
        Ok(Box::new(gateway_side))
    }
}

async fn serve_mock_connection<S>(socket: S, conn_id: usize, shared: Arc<MockShared>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let behavior = &shared.behavior;
    let mut framed = Framed::new(socket, RespFrameCodec);
    let mut db: i64 = 0;

    while let Some(Ok(frame)) = framed.next().await {
        let args = frame_args(&frame);
        shared.log.lock()[conn_id].push(args.clone());
        let name = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();

        let reply = match name.as_str() {
            "AUTH" => {
                if let Some(delay) = behavior.auth_delay {
                    tokio::time::sleep(delay).await;
                }
                let password = args.last().cloned().unwrap_or_default();
                let accepted = behavior
                    .passwords
                    .as_ref()
                    .is_none_or(|list| list.contains(&password));
                if accepted && args.len() > 1 {
                    RespFrame::SimpleString("OK".into())
                } else {
                    RespFrame::Error("ERR invalid password".into())
                }
            }
            "SELECT" => match (&behavior.select_error, args.get(1).and_then(|s| s.parse::<i64>().ok())) {
                (Some(err), _) => RespFrame::Error(err.clone()),
                (None, Some(index)) if (0..16).contains(&index) => {
                    db = index;
                    RespFrame::SimpleString("OK".into())
                }
                (None, _) => RespFrame::Error("ERR DB index is out of range".into()),
            },
            "PING" => RespFrame::SimpleString("PONG".into()),
            "ECHO" if args.len() == 2 => RespFrame::BulkString(Bytes::from(args[1].clone())),
            "SET" if args.len() == 3 => {
                shared
                    .keyspace
                    .lock()
                    .insert((db, args[1].clone()), args[2].clone());
                RespFrame::SimpleString("OK".into())
            }
            "GET" if args.len() == 2 => {
                let value = shared.keyspace.lock().get(&(db, args[1].clone())).cloned();
                match value {
                    Some(value) => RespFrame::BulkString(Bytes::from(value)),
                    None => RespFrame::Null,
                }
            }
            "QUIT" => {
                let _ = framed.send(RespFrame::SimpleString("OK".into())).await;
                break;
            }
            _ => RespFrame::Error(format!("ERR unknown command '{}'", args.first().cloned().unwrap_or_default())),
        };

        if framed.send(reply).await.is_err() {
            break;
        }
    }
    shared.closed.fetch_add(1, Ordering::SeqCst);
}

fn frame_args(frame: &RespFrame) -> Vec<String> {
    match frame {
        RespFrame::Array(items) => items
            .iter()
            .map(|item| match item {
                RespFrame::BulkString(b) => String::from_utf8_lossy(b).to_string(),
                other => format!("{other:?}"),
            })
            .collect(),
        other => vec![format!("{other:?}")],
    }
}

/// A dialer that counts how often it is asked to dial before delegating.
pub struct CountingDialer {
    inner: UpstreamDialer,
    pub dials: AtomicUsize,
}

impl CountingDialer {
    pub fn new() -> Self {
        Self {
            inner: UpstreamDialer::new(Duration::from_secs(1)),
            dials: AtomicUsize::new(0),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<UpstreamStream, GatewayError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(network, address).await
    }
}

/// A gateway running in-process on an ephemeral port, without signal handling.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: Arc<GatewayState>,
    shutdown_tx: broadcast::Sender<()>,
    results: Arc<Mutex<Vec<Result<(), GatewayError>>>>,
    handle: JoinHandle<()>,
}

impl TestGateway {
    /// A config pointing at `upstream` with test-friendly defaults.
    pub fn config_for(upstream: SocketAddr) -> Config {
        let mut config = Config::default();
        config.upstream.address = upstream.to_string();
        config.upstream.connect_timeout = Duration::from_secs(1);
        config
    }

    pub async fn start(config: Config, snapshot: CredentialSnapshot) -> Self {
        let dialer = Arc::new(UpstreamDialer::new(config.upstream.connect_timeout));
        Self::with_dialer(config, snapshot, dialer).await
    }

    pub async fn with_dialer(
        config: Config,
        snapshot: CredentialSnapshot,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        init_tracing();
        let credentials = Arc::new(CredentialStore::new(snapshot));
        let state = Arc::new(GatewayState::new(config, credentials, dialer));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let results = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let state = state.clone();
            let shutdown_tx = shutdown_tx.clone();
            let results = results.clone();
            tokio::spawn(async move {
                let mut accept_shutdown = shutdown_tx.subscribe();
                let mut session_id: u64 = 0;
                loop {
                    tokio::select! {
                        Ok(()) = accept_shutdown.recv() => break,
                        Ok((socket, peer)) = listener.accept() => {
                            session_id += 1;
                            let handler = ConnectionHandler::new(
                                socket,
                                peer,
                                state.clone(),
                                session_id,
                                shutdown_tx.subscribe(),
                            );
                            let results = results.clone();
                            tokio::spawn(async move {
                                let result = handler.run().await;
                                results.lock().push(result);
                            });
                        }
                        else => break,
                    }
                }
            })
        };

        Self {
            addr,
            state,
            shutdown_tx,
            results,
            handle,
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    /// Broadcasts the shutdown signal to the accept loop and every session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits until `n` sessions have finished and returns their results.
    pub async fn finished_sessions(&self, n: usize) -> Vec<Result<(), GatewayError>> {
        tokio::time::timeout(REPLY_TIMEOUT, async {
            while self.results.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions did not finish in time");
        self.results.lock().clone()
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A RESP client speaking arrays of bulk strings.
pub struct TestClient {
    framed: Framed<TcpStream, RespFrameCodec>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, RespFrameCodec),
        }
    }

    pub async fn send(&mut self, parts: &[&str]) {
        let frame = RespFrame::command(parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())));
        self.framed.send(frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// Closes the write side; the gateway sees end-of-stream.
    pub async fn shutdown_write(&mut self) {
        self.framed.get_mut().shutdown().await.unwrap();
    }

    /// The next reply, or `None` if the gateway closed the connection.
    pub async fn recv(&mut self) -> Option<RespFrame> {
        tokio::time::timeout(REPLY_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a reply")
            .map(|res| res.expect("gateway sent a malformed reply"))
    }

    /// Like `recv`, but lets the caller observe its own deadline elapsing.
    pub async fn recv_within(
        &mut self,
        deadline: Duration,
    ) -> Result<Option<RespFrame>, tokio::time::error::Elapsed> {
        tokio::time::timeout(deadline, self.framed.next())
            .await
            .map(|next| next.and_then(Result::ok))
    }

    pub async fn command(&mut self, parts: &[&str]) -> RespFrame {
        self.send(parts).await;
        self.recv().await.expect("connection closed before a reply arrived")
    }

    pub async fn expect_closed(&mut self) {
        assert_eq!(self.recv().await, None, "expected the gateway to close the connection");
    }
}

pub fn ok() -> RespFrame {
    RespFrame::SimpleString("OK".into())
}

pub fn bulk(value: &str) -> RespFrame {
    RespFrame::BulkString(Bytes::from(value.to_string()))
}

pub fn error(message: &str) -> RespFrame {
    RespFrame::Error(message.into())
}
