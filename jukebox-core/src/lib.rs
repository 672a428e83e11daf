//! LAN Jukebox - Core Library
//!
//! Shared play queue across terminals on a local network. One machine hosts
//! the queue and drives a local media engine, the others follow along and
//! contribute tracks.

pub mod config;
pub mod engine;
pub mod logging;
pub mod network;
pub mod resolve;
#[cfg(unix)]
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use config::JukeboxConfig;
pub use network::{BroadcastServer, NetworkConfig, NetworkError, PeerClient, ServerEvent};
pub use resolve::{StreamResolver, YtDlpResolver};
pub use sync::{Message, PeerMirror, PlaybackSnapshot, TrackEntry};

#[cfg(unix)]
pub use engine::MediaEngine;
#[cfg(unix)]
pub use session::{HostSession, PeerSession, TickReport};
