// src/core/mod.rs

//! The central module containing the gateway's protocol, routing and relay logic.

pub mod credentials;
pub mod dialer;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod state;

pub use credentials::{CredentialEntry, CredentialSnapshot, CredentialStore};
pub use dialer::{Dialer, UpstreamDialer, UpstreamStream};
pub use errors::GatewayError;
