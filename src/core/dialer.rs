// src/core/dialer.rs

//! Establishes the per-session connection to the upstream server.
//!
//! Sessions never create sockets themselves. They are handed a [`Dialer`] and call it
//! once, after the client's first command has been read, so that tests can swap in
//! an in-memory upstream and idle clients never cost an upstream connection.

use crate::config::UpstreamConfig;
use crate::core::GatewayError;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, rustls};
use tracing::debug;

/// Any bidirectional byte stream that can serve as an upstream connection.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// The connection type every dialer returns.
pub type UpstreamStream = Box<dyn UpstreamIo>;

/// The capability of opening a connection to an upstream server.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `address` over `network` (`"tcp"` or `"unix"`).
    async fn dial(&self, network: &str, address: &str) -> Result<UpstreamStream, GatewayError>;
}

/// Dials real sockets: TCP, TCP wrapped in TLS, or Unix domain sockets.
pub struct UpstreamDialer {
    connect_timeout: Duration,
    tls: Option<UpstreamTls>,
}

struct UpstreamTls {
    connector: TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
}

impl UpstreamDialer {
    /// A plain dialer with no TLS.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            tls: None,
        }
    }

    /// Builds a dialer from the upstream section of the configuration, loading the
    /// webpki root certificates when TLS to the upstream is enabled.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let mut dialer = Self::new(config.connect_timeout);
        if config.tls_enabled {
            let mut root_cert_store = rustls::RootCertStore::empty();
            root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            let name = config.tls_server_name();
            let server_name = rustls::pki_types::ServerName::try_from(name.as_str())
                .map_err(|_| anyhow!("Invalid upstream TLS server name '{name}'"))?
                .to_owned();

            dialer.tls = Some(UpstreamTls {
                connector: TlsConnector::from(Arc::new(tls_config)),
                server_name,
            });
        }
        Ok(dialer)
    }

    async fn dial_tcp(&self, address: &str) -> Result<UpstreamStream, GatewayError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                GatewayError::UpstreamUnavailable(format!("connect to {address} timed out"))
            })?
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("connect to {address}: {e}")))?;
        stream.set_nodelay(true)?;

        let Some(tls) = &self.tls else {
            return Ok(Box::new(stream));
        };
        debug!("Starting TLS handshake with upstream at {address}");
        let tls_stream = tokio::time::timeout(
            self.connect_timeout,
            tls.connector.connect(tls.server_name.clone(), stream),
        )
        .await
        .map_err(|_| GatewayError::UpstreamUnavailable("TLS handshake timed out".into()))?
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(tls_stream))
    }

    #[cfg(unix)]
    async fn dial_unix(&self, path: &str) -> Result<UpstreamStream, GatewayError> {
        let stream = tokio::time::timeout(self.connect_timeout, tokio::net::UnixStream::connect(path))
            .await
            .map_err(|_| GatewayError::UpstreamUnavailable(format!("connect to {path} timed out")))?
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("connect to {path}: {e}")))?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Dialer for UpstreamDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<UpstreamStream, GatewayError> {
        match network {
            "tcp" => self.dial_tcp(address).await,
            #[cfg(unix)]
            "unix" => self.dial_unix(address).await,
            other => Err(GatewayError::UpstreamUnavailable(format!(
                "unsupported network '{other}'"
            ))),
        }
    }
}
