//! LAN Networking
//!
//! One TCP connection per peer, carrying line-delimited JSON frames.
//! The host runs a [`BroadcastServer`], peers connect with a [`PeerClient`].

mod client;
mod server;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

pub use client::PeerClient;
pub use server::{BroadcastServer, ServerEvent};

/// A read with no complete line within this window counts as a disconnect
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Peers give up connecting to the host after this long
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the host listens on
    pub bind_addr: IpAddr,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    /// A single frame write that takes longer than this drops the connection
    pub write_timeout: Duration,
    /// Frames buffered per peer before it is considered too slow and pruned
    pub outbound_capacity: usize,
    /// How often a listening peer re-sends `hello` so the host's read timeout
    /// never fires on a quiet peer
    pub keepalive_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            read_timeout: READ_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            write_timeout: Duration::from_secs(5),
            outbound_capacity: 64,
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

/// Network-related errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server is not running")]
    NotStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
