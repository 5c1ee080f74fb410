// src/config.rs

//! Manages gateway configuration: loading, resolving defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Where and how to reach the shared upstream server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpstreamConfig {
    /// `"tcp"` or `"unix"`.
    #[serde(default = "default_network")]
    pub network: String,
    /// `host:port` for TCP, a socket path for Unix.
    #[serde(default = "default_upstream_address")]
    pub address: String,
    /// Bound on establishing the upstream connection (including TLS).
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Bound on each handshake round-trip with the upstream. `0s` disables the bound.
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    #[serde(default)]
    pub tls_enabled: bool,
    /// Name used for TLS verification. Defaults to the host part of `address`.
    #[serde(default)]
    pub tls_server_name: Option<String>,
}

impl UpstreamConfig {
    /// The handshake bound, or `None` when it is disabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (!self.handshake_timeout.is_zero()).then_some(self.handshake_timeout)
    }

    /// The name to verify the upstream's certificate against.
    pub fn tls_server_name(&self) -> String {
        if let Some(name) = &self.tls_server_name {
            return name.clone();
        }
        match self.address.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']').to_string(),
            None => self.address.clone(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            address: default_upstream_address(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            tls_enabled: false,
            tls_server_name: None,
        }
    }
}

fn default_network() -> String {
    "tcp".to_string()
}
fn default_upstream_address() -> String {
    "127.0.0.1:6379".to_string()
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration for TLS termination of client connections.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "respgate.crt".to_string()
}
fn default_key_path() -> String {
    "respgate.key".to_string()
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9121
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    #[serde(default)]
    credentials_file: Option<String>,
    #[serde(default)]
    upstream: UpstreamConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6380
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10000
}

/// Represents the final, validated gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_clients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<String>,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            credentials_file: None,
            upstream: UpstreamConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw_config: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            log_level: raw_config.log_level,
            max_clients: raw_config.max_clients,
            credentials_file: raw_config.credentials_file,
            upstream: raw_config.upstream,
            tls: raw_config.tls,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }

        match self.upstream.network.as_str() {
            "tcp" => {}
            "unix" => {
                if self.upstream.tls_enabled {
                    return Err(anyhow!("upstream.tls_enabled requires the tcp network"));
                }
            }
            other => {
                return Err(anyhow!(
                    "upstream.network must be 'tcp' or 'unix', got '{other}'"
                ));
            }
        }
        if self.upstream.address.trim().is_empty() {
            return Err(anyhow!("upstream.address cannot be empty"));
        }
        if self.upstream.connect_timeout.is_zero() {
            return Err(anyhow!("upstream.connect_timeout cannot be 0"));
        }
        if self.upstream.handshake_timeout().is_none() {
            warn!(
                "upstream.handshake_timeout is disabled. A stalled upstream can pin a session indefinitely."
            );
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }

        if self.credentials_file.is_none() {
            warn!("No credentials_file configured. Every tenant will use the upstream's default database.");
        }
        Ok(())
    }
}
