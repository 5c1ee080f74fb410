// src/connection/mod.rs

//! Manages the lifecycle of a single client connection: the authentication
//! handshake, tenant database pinning, and the hand-off to the byte relay.

mod guard;
mod handler;
mod session;

pub use guard::ConnectionGuard;
pub use handler::ConnectionHandler;
pub use session::{Session, SessionPhase, auth_secret};
