//! Line-delimited JSON framing
//!
//! One message per line, `\n`-terminated. Reading collapses timeout, EOF and
//! malformed input into `None`; the cause is only visible in the logs.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::debug;

use super::protocol::Message;

/// Frames longer than this are treated as garbage
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Why a frame could not be read
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("no complete line within {0:?}")]
    Timeout(Duration),

    #[error("stream closed")]
    Eof,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds maximum length")]
    TooLong,

    #[error("undecodable frame")]
    Malformed,
}

/// Encode a message as a single JSON line
pub fn encode(msg: &Message) -> Vec<u8> {
    // Serializing our own types into a Vec cannot fail
    let mut buf = serde_json::to_vec(msg).unwrap_or_default();
    buf.push(b'\n');
    buf
}

/// Decode one line. Returns `None` on empty input, bad UTF-8 or bad JSON.
pub fn decode_line(line: &[u8]) -> Option<Message> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// Read the next frame, distinguishing failure causes
pub async fn next_frame<R>(reader: &mut R, timeout: Duration) -> Result<Message, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_FRAME_LEN as u64 + 1);

    let read = tokio::time::timeout(timeout, limited.read_until(b'\n', &mut line))
        .await
        .map_err(|_| FrameError::Timeout(timeout))??;

    if read == 0 {
        return Err(FrameError::Eof);
    }
    if line.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong);
    }
    if line.last() != Some(&b'\n') {
        // Stream ended mid-line
        return Err(FrameError::Eof);
    }

    decode_line(&line).ok_or(FrameError::Malformed)
}

/// Read the next frame. `None` means timeout, EOF or malformed data;
/// callers must treat all three the same way.
pub async fn read_frame<R>(reader: &mut R, timeout: Duration) -> Option<Message>
where
    R: AsyncBufRead + Unpin,
{
    match next_frame(reader, timeout).await {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("Frame read ended: {}", e);
            None
        }
    }
}
