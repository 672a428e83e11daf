//! Queue and Playback State

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::protocol::{PlaybackSnapshot, TrackEntry};

/// FIFO play queue. Append at the tail, next-to-play at the head.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Queue {
    entries: VecDeque<TrackEntry>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TrackEntry) {
        self.entries.push_back(entry);
    }

    /// Take the next track to play
    pub fn pop(&mut self) -> Option<TrackEntry> {
        self.entries.pop_front()
    }

    /// Remove the entry at `index`, if any
    pub fn remove(&mut self, index: usize) -> Option<TrackEntry> {
        self.entries.remove(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<TrackEntry> {
        self.entries.iter().cloned().collect()
    }
}

impl From<Vec<TrackEntry>> for Queue {
    fn from(entries: Vec<TrackEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }
}

/// Authoritative state held by the host
#[derive(Debug, Default)]
pub struct HostState {
    pub queue: Queue,
    /// Track currently playing (or being loaded)
    pub track: Option<TrackEntry>,
    /// A stream URL is being resolved for `track`
    pub loading: bool,
}

impl HostState {
    /// Build a snapshot with the given engine readings
    pub fn snapshot(&self, position: f64, duration: f64, paused: bool) -> PlaybackSnapshot {
        PlaybackSnapshot {
            queue: self.queue.to_vec(),
            track: self.track.clone(),
            position,
            duration,
            paused,
        }
    }

    /// Mark `entry` as current and loading
    pub fn begin_loading(&mut self, entry: TrackEntry) {
        self.track = Some(entry);
        self.loading = true;
    }

    /// Stream resolution finished. Clears the track on failure.
    pub fn finish_loading(&mut self, ok: bool) {
        self.loading = false;
        if !ok {
            self.track = None;
        }
    }
}

/// Read-only mirror of the host state kept by a peer
#[derive(Debug, Clone)]
pub struct PeerMirror {
    pub queue: Queue,
    pub track: Option<TrackEntry>,
    pub position: f64,
    pub duration: f64,
    pub paused: bool,
    /// When we last applied a snapshot
    pub last_sync: Option<Instant>,
}

impl PeerMirror {
    pub fn new() -> Self {
        Self {
            queue: Queue::new(),
            track: None,
            position: 0.0,
            duration: 0.0,
            paused: false,
            last_sync: None,
        }
    }

    /// Replace the mirror with a snapshot from the host.
    /// Progress fields are dropped when no track is playing.
    pub fn apply(&mut self, snapshot: PlaybackSnapshot) {
        self.queue = Queue::from(snapshot.queue);
        self.track = snapshot.track;

        if self.track.is_some() {
            self.position = snapshot.position;
            self.duration = snapshot.duration;
            self.paused = snapshot.paused;
        } else {
            self.position = 0.0;
            self.duration = 0.0;
            self.paused = false;
        }
        self.last_sync = Some(Instant::now());
    }

    /// Check if we haven't heard from the host for a while
    pub fn is_stale(&self, timeout: Duration) -> bool {
        match self.last_sync {
            Some(at) => at.elapsed() > timeout,
            None => true,
        }
    }
}

impl Default for PeerMirror {
    fn default() -> Self {
        Self::new()
    }
}
