//! Network module - TCP listener and per-connection plumbing
//!
//! Provides:
//! - Connection: a buffered stream speaking the frame protocol
//! - Server: accepts clients and drives a Session per connection

mod connection;
mod server;

pub use connection::*;
pub use server::*;

use std::time::Duration;

use crate::protocol::DEFAULT_PORT;

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Port to listen on
    pub port: u16,
    /// Address to bind, default all interfaces
    pub bind_address: String,
    /// How long a client may sit in AuthRequested before being closed.
    /// None means wait forever; the protocol itself mandates no timeout.
    pub auth_timeout: Option<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            auth_timeout: None,
        }
    }
}

