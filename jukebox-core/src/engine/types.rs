//! Types for the engine control protocol

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Property names we query
pub const PROP_POSITION: &str = "playback-time";
pub const PROP_DURATION: &str = "duration";
pub const PROP_PAUSE: &str = "pause";
pub const PROP_VOLUME: &str = "volume";

/// Volume bounds accepted by the engine
pub const VOLUME_MIN: f64 = 0.0;
pub const VOLUME_MAX: f64 = 150.0;

/// Request body: `{"command": [name, args...]}`
#[derive(Debug, Clone, Serialize)]
pub struct EngineCommand {
    pub command: Vec<Value>,
}

impl EngineCommand {
    pub fn get_property(name: &str) -> Self {
        Self {
            command: vec!["get_property".into(), name.into()],
        }
    }

    pub fn cycle(name: &str) -> Self {
        Self {
            command: vec!["cycle".into(), name.into()],
        }
    }

    /// Relative seek by `seconds` (negative goes back)
    pub fn seek_relative(seconds: f64) -> Self {
        Self {
            command: vec!["seek".into(), seconds.into(), "relative".into()],
        }
    }

    pub fn set_property(name: &str, value: impl Into<Value>) -> Self {
        Self {
            command: vec!["set_property".into(), name.into(), value.into()],
        }
    }

    pub fn quit() -> Self {
        Self {
            command: vec!["quit".into()],
        }
    }

    /// Newline-terminated JSON frame
    pub fn to_frame(&self) -> Vec<u8> {
        let mut buf = serde_json::to_vec(self).unwrap_or_default();
        buf.push(b'\n');
        buf
    }
}

/// Answer to a command. `error` is `"success"` when it worked.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineReply {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl EngineReply {
    pub fn is_success(&self) -> bool {
        self.error.as_deref() == Some("success")
    }

    /// `data` of a successful reply
    pub fn into_data(self) -> Option<Value> {
        if self.is_success() {
            self.data
        } else {
            None
        }
    }
}

/// Unsolicited notification from the engine (any frame with an `event` key)
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub name: String,
    pub raw: Value,
}

impl EngineEvent {
    /// Classify a frame: `Some` for notifications, `None` for replies
    pub fn from_frame(frame: &Value) -> Option<Self> {
        let name = frame.get("event")?;
        Some(Self {
            name: name.as_str().unwrap_or_default().to_string(),
            raw: frame.clone(),
        })
    }
}

/// Identity of one engine session, used to derive a unique socket address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Process id plus a random suffix, so sessions in one process never collide
    pub fn generate() -> Self {
        use rand::Rng;
        let suffix: u32 = rand::thread_rng().gen();
        SessionId(format!("{}-{:08x}", std::process::id(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Control socket path for this session inside `dir`
    pub fn socket_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("jukebox-engine-{}.sock", self.0))
    }
}
