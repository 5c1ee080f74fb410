// src/server/initialization.rs

//! Handles gateway initialization: credentials, upstream dialer, TLS and the listener.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::credentials::{CredentialStore, load_credentials_file};
use crate::core::dialer::UpstreamDialer;
use crate::core::metrics;
use crate::core::state::GatewayState;
use anyhow::{Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{info, warn};

/// Initializes all gateway components before starting the accept loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let acceptor = setup_tls(&config)?;
    let credentials = Arc::new(load_initial_credentials(&config).await?);
    let dialer = Arc::new(UpstreamDialer::from_config(&config.upstream)?);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("respgate listening on {}:{}", config.host, config.port);
    let connection_permits = Arc::new(Semaphore::new(config.max_clients));

    let state = Arc::new(GatewayState::new(config, credentials, dialer));

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        acceptor,
        connection_permits,
    })
}

/// Loads the credential file named in the configuration, if any. A file that is
/// configured but unreadable or invalid is fatal at startup.
pub async fn load_initial_credentials(config: &Config) -> Result<CredentialStore> {
    let Some(path) = &config.credentials_file else {
        warn!("No credentials_file configured; every session will use the default database.");
        metrics::CREDENTIALS_LOADED.set(0.0);
        return Ok(CredentialStore::default());
    };
    let snapshot = load_credentials_file(path).await?;
    info!("Loaded {} tenant credential(s) from '{}'.", snapshot.len(), path);
    metrics::CREDENTIALS_LOADED.set(snapshot.len() as f64);
    Ok(CredentialStore::new(snapshot))
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if !config.tls.enabled {
        return Ok(None);
    }
    info!("Client TLS is enabled. Loading certificate and key.");
    let certs = load_certs(&config.tls.cert_path)?;
    let key = load_key(&config.tls.key_path)?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

fn log_startup_info(config: &Config) {
    info!(
        "Upstream: {} {} (TLS {}).",
        config.upstream.network,
        config.upstream.address,
        if config.upstream.tls_enabled { "on" } else { "off" }
    );
    match config.upstream.handshake_timeout() {
        Some(limit) => info!("Handshake round-trips are bounded to {:?}.", limit),
        None => warn!("Handshake round-trips are unbounded."),
    }
    info!("Accepting at most {} concurrent clients.", config.max_clients);
}
