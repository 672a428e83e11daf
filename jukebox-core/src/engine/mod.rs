//! Media Engine Bridge
//!
//! Spawns an external playback engine (mpv-compatible) and controls it over
//! a local JSON IPC socket. The bridge itself needs Unix domain sockets.

#[cfg(unix)]
mod bridge;
mod types;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[cfg(unix)]
pub use bridge::{EngineState, MediaEngine};
#[cfg(all(test, unix))]
pub(crate) use bridge::stubborn_engine_script;
pub use types::*;

/// Default engine executable
pub const DEFAULT_PROGRAM: &str = "mpv";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine executable, looked up on PATH when relative
    pub program: PathBuf,
    /// Extra arguments placed before the stream URL
    pub extra_args: Vec<String>,
    /// Directory for control sockets
    pub socket_dir: PathBuf,
    /// How many times to look for the control socket after spawning
    pub socket_poll_attempts: u32,
    pub socket_poll_interval: Duration,
    /// Per-command write and reply timeout
    pub reply_timeout: Duration,
    /// How long `stop` waits for a graceful exit before killing
    pub stop_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            extra_args: Vec::new(),
            socket_dir: std::env::temp_dir(),
            socket_poll_attempts: 30,
            socket_poll_interval: Duration::from_millis(100),
            reply_timeout: Duration::from_millis(200),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Errors inside the bridge. The public API collapses these to
/// `false` or default values; they exist so the cause gets logged.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Control socket {} never appeared", .0.display())]
    SocketTimeout(PathBuf),

    #[error("Failed to connect control socket: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Not connected to the engine")]
    NotConnected,

    #[error("Failed to write command: {0}")]
    Write(#[source] std::io::Error),

    #[error("No reply within timeout")]
    ReplyTimeout,

    #[error("Control socket closed")]
    Closed,
}
