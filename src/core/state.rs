// src/core/state.rs

//! The state shared by every session: configuration, credentials and the dialer.

use crate::config::Config;
use crate::core::credentials::CredentialStore;
use crate::core::dialer::Dialer;
use std::sync::Arc;
use std::time::Duration;

/// Everything a session needs beyond its own sockets. Read-only after startup,
/// except for the credential snapshot, which is swapped as a whole on reload.
pub struct GatewayState {
    pub config: Config,
    pub credentials: Arc<CredentialStore>,
    pub dialer: Arc<dyn Dialer>,
}

impl GatewayState {
    pub fn new(config: Config, credentials: Arc<CredentialStore>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config,
            credentials,
            dialer,
        }
    }

    pub fn upstream_network(&self) -> &str {
        &self.config.upstream.network
    }

    pub fn upstream_address(&self) -> &str {
        &self.config.upstream.address
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.config.upstream.handshake_timeout()
    }
}
