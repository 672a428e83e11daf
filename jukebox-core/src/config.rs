//! Runtime configuration
//!
//! Defaults hold the reference constants. Environment variables override
//! them, command line flags override the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::network::NetworkConfig;
use crate::resolve::DEFAULT_RESOLVER;
use crate::sync::DEFAULT_PORT;

/// How often the host samples the engine and broadcasts a snapshot
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

pub const ENV_PORT: &str = "JUKEBOX_PORT";
pub const ENV_ENGINE: &str = "JUKEBOX_ENGINE";
pub const ENV_SOCKET_DIR: &str = "JUKEBOX_SOCKET_DIR";
pub const ENV_RESOLVER: &str = "JUKEBOX_RESOLVER";

#[derive(Debug, Clone)]
pub struct JukeboxConfig {
    /// TCP port for hosting and joining
    pub port: u16,
    pub tick_interval: Duration,
    /// Search/stream resolver executable
    pub resolver: PathBuf,
    pub network: NetworkConfig,
    pub engine: EngineConfig,
}

impl Default for JukeboxConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tick_interval: TICK_INTERVAL,
            resolver: PathBuf::from(DEFAULT_RESOLVER),
            network: NetworkConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl JukeboxConfig {
    /// Defaults with overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides from `lookup`. Empty or unparsable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(port) = var(ENV_PORT).and_then(|p| p.trim().parse().ok()) {
            config.port = port;
        }
        if let Some(program) = var(ENV_ENGINE) {
            config.engine.program = PathBuf::from(program);
        }
        if let Some(dir) = var(ENV_SOCKET_DIR) {
            config.engine.socket_dir = PathBuf::from(dir);
        }
        if let Some(program) = var(ENV_RESOLVER) {
            config.resolver = PathBuf::from(program);
        }

        config
    }
}
