//! Terminal formatting for the status line

use jukebox_core::{PeerMirror, PlaybackSnapshot, TrackEntry};

/// Partial cells, in eighths
const BLOCKS: [char; 9] = [' ', '▏', '▎', '▍', '▌', '▋', '▊', '▉', '█'];

/// `m:ss`, or `h:mm:ss` past an hour. Missing or zero durations show `--:--`.
pub fn fmt_dur(seconds: Option<f64>) -> String {
    let seconds = match seconds {
        Some(s) if s.is_finite() && s > 0.0 => s as u64,
        _ => return "--:--".to_string(),
    };
    let (minutes, secs) = (seconds / 60, seconds % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// Smooth bar `width` cells wide, `ratio` clamped to [0, 1]
pub fn progress_bar(ratio: f64, width: usize) -> String {
    let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
    let eighths = (ratio * width as f64 * 8.0) as usize;
    let (full, partial) = (eighths / 8, eighths % 8);
    let empty = width.saturating_sub(full + usize::from(partial > 0));

    let mut bar = String::with_capacity(width * 3);
    bar.extend(std::iter::repeat('█').take(full));
    if partial > 0 {
        bar.push(BLOCKS[partial]);
    }
    bar.extend(std::iter::repeat('─').take(empty));
    bar
}

fn track_line(track: Option<&TrackEntry>, position: f64, duration: f64, paused: bool) -> String {
    match track {
        Some(track) => {
            let ratio = if duration > 0.0 { position / duration } else { 0.0 };
            format!(
                "{} {}  {} / {} {}",
                if paused { "⏸" } else { "▶" },
                track.title,
                fmt_dur(Some(position)),
                fmt_dur(Some(duration).filter(|d| *d > 0.0).or(track.duration)),
                progress_bar(ratio, 20),
            )
        }
        None => "■ nothing playing".to_string(),
    }
}

/// One-line host status
pub fn host_status(snapshot: &PlaybackSnapshot, loading: bool, clients: Option<usize>) -> String {
    let mut line = if loading {
        match &snapshot.track {
            Some(track) => format!("… loading {}", track.title),
            None => "… loading".to_string(),
        }
    } else {
        track_line(
            snapshot.track.as_ref(),
            snapshot.position,
            snapshot.duration,
            snapshot.paused,
        )
    };
    line.push_str(&format!("  queue: {}", snapshot.queue.len()));
    if let Some(clients) = clients {
        line.push_str(&format!("  peers: {}", clients));
    }
    line
}

/// One-line peer status
pub fn peer_status(mirror: &PeerMirror) -> String {
    format!(
        "{}  queue: {}",
        track_line(mirror.track.as_ref(), mirror.position, mirror.duration, mirror.paused),
        mirror.queue.len()
    )
}

/// Numbered listing, as printed by `search`
pub fn entry_row(index: usize, entry: &TrackEntry) -> String {
    format!(
        "{:>2}. {}  [{}]  {}",
        index + 1,
        entry.title,
        entry.channel.as_deref().unwrap_or("—"),
        fmt_dur(entry.duration)
    )
}
