// src/core/relay.rs

//! The post-handshake byte relay between a client and its upstream connection.
//!
//! Both directions are pumped concurrently. Whichever direction stops first, by
//! end-of-stream, error or the process-wide shutdown signal, ends the relay: the
//! other direction is cancelled and both write sides are shut down, so neither peer
//! is left half-open talking to a dead connection.

use crate::core::GatewayError;
use crate::core::metrics;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, split};
use tokio::sync::broadcast;
use tracing::debug;

/// Size of the chunk read from one side before it is written to the other.
const RELAY_CHUNK_SIZE: usize = 16 * 1024;
/// Upper bound on flushing and closing a write side once the relay is over.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// One direction of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused the relay to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client closed its side of the connection.
    ClientClosed,
    /// The upstream closed its side of the connection.
    UpstreamClosed,
    /// The gateway is shutting down.
    Shutdown,
}

/// Byte totals and the cause of termination for a finished relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub ended_by: RelayEnd,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relays bytes between `client` and `upstream` until either side stops.
///
/// Bytes already buffered inside either stream (for example commands a client
/// pipelined behind its `AUTH`) are relayed first. Returns an error only when the
/// direction that ended the relay failed with an I/O error; both sides are closed
/// in every case.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<RelaySummary, GatewayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = split(client);
    let (mut upstream_r, mut upstream_w) = split(upstream);
    let to_upstream = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);

    let outcome = {
        let forward = pump(
            &mut client_r,
            &mut upstream_w,
            &to_upstream,
            Direction::ClientToUpstream,
        );
        let backward = pump(
            &mut upstream_r,
            &mut client_w,
            &to_client,
            Direction::UpstreamToClient,
        );

        tokio::select! {
            biased;
            Ok(()) = shutdown_rx.recv() => Ok(RelayEnd::Shutdown),
            res = forward => res
                .map(|_| RelayEnd::ClientClosed)
                .map_err(|e| (Direction::ClientToUpstream, e)),
            res = backward => res
                .map(|_| RelayEnd::UpstreamClosed)
                .map_err(|e| (Direction::UpstreamToClient, e)),
        }
    };

    // The losing direction has been dropped; close both write sides so the peers see EOF.
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, upstream_w.shutdown()).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, client_w.shutdown()).await;

    let summary = |ended_by| RelaySummary {
        ended_by,
        client_to_upstream: to_upstream.load(Ordering::Relaxed),
        upstream_to_client: to_client.load(Ordering::Relaxed),
    };

    match outcome {
        Ok(ended_by) => {
            let summary = summary(ended_by);
            debug!("Relay finished: {:?}", summary);
            Ok(summary)
        }
        Err((direction, e)) => Err(GatewayError::RelayIo(format!("{direction}: {e}"))),
    }
}

/// Copies one direction chunk by chunk, writing each chunk through as soon as it is read.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    direction: Direction,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        metrics::RELAYED_BYTES_TOTAL
            .with_label_values(&[direction.as_str()])
            .inc_by(n as u64);
    }
}
