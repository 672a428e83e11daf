//! Sync Protocol Messages

use serde::{Deserialize, Serialize};

/// Default TCP port for the LAN sync protocol
pub const DEFAULT_PORT: u16 = 7685;

/// A playable item, as produced by search or URL lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    /// Video/stream ID
    #[serde(default)]
    pub id: String,
    /// Display title
    #[serde(default)]
    pub title: String,
    /// Channel or uploader name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Duration in seconds, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl TrackEntry {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            channel: None,
            duration: None,
        }
    }

    /// An entry is usable only if both `id` and `title` are non-empty
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.title.is_empty()
    }
}

/// Full playback state as seen by the host. Never a delta.
///
/// When `track` is `None` the progress fields carry no meaning and
/// receivers must ignore them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    #[serde(default)]
    pub queue: Vec<TrackEntry>,
    #[serde(default)]
    pub track: Option<TrackEntry>,
    /// Position in seconds
    #[serde(default)]
    pub position: f64,
    /// Duration in seconds
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub paused: bool,
}

impl PlaybackSnapshot {
    /// Progress ratio in [0, 1], or 0 when nothing meaningful is playing
    pub fn progress(&self) -> f64 {
        if self.track.is_none() || self.duration <= 0.0 {
            return 0.0;
        }
        (self.position / self.duration).clamp(0.0, 1.0)
    }
}

/// Messages exchanged between host and peers, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Announces a new connection (peer -> host)
    Hello,

    /// Request to append a track to the host queue (peer -> host)
    Add { entry: TrackEntry },

    /// Acknowledges an accepted `add` (host -> peer)
    Ack { title: String },

    /// Full state snapshot (host -> peer)
    Sync(PlaybackSnapshot),

    /// Any tag we don't understand. Receivers ignore it.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello => "hello",
            Message::Add { .. } => "add",
            Message::Ack { .. } => "ack",
            Message::Sync(_) => "sync",
            Message::Unknown => "unknown",
        }
    }
}
