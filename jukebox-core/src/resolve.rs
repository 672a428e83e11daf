//! Track lookup and stream resolution
//!
//! The default resolver shells out to `yt-dlp`. Every operation degrades to an
//! empty/absent result instead of an error, so a broken resolver never takes
//! the session down with it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::sync::TrackEntry;

/// Default resolver executable
pub const DEFAULT_RESOLVER: &str = "yt-dlp";

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_TIMEOUT: Duration = Duration::from_secs(30);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Why a resolver invocation produced nothing
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Resolver not found: {0}")]
    NotFound(#[source] std::io::Error),

    #[error("Resolver timed out after {0:?}")]
    Timeout(Duration),

    #[error("Resolver exited with {0}")]
    Failed(std::process::ExitStatus),

    #[error("Failed to parse resolver output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Finds tracks and turns them into playable stream URLs
#[async_trait]
pub trait StreamResolver: Send + Sync {
    /// Up to `count` matches for a free-text query
    async fn search(&self, query: &str, count: usize) -> Vec<TrackEntry>;

    /// Direct audio stream for an entry
    async fn stream_url(&self, entry: &TrackEntry) -> Option<String>;

    /// Metadata for a URL. Falls back to an entry whose id and title are the URL.
    async fn lookup(&self, url: &str) -> TrackEntry;
}

/// Page URL for an entry. Ids that are already URLs pass through.
pub fn watch_url(id: &str) -> String {
    if id.starts_with("http://") || id.starts_with("https://") {
        id.to_string()
    } else {
        format!("https://www.youtube.com/watch?v={}", id)
    }
}

/// One line of `--dump-json` output. Only the fields we keep.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

impl From<VideoInfo> for TrackEntry {
    fn from(info: VideoInfo) -> Self {
        TrackEntry {
            title: info.title.unwrap_or_else(|| info.id.clone()),
            id: info.id,
            channel: info.channel.or(info.uploader),
            duration: info.duration,
        }
    }
}

/// Parse newline-separated JSON objects, skipping anything undecodable
fn parse_entries(output: &str) -> Vec<TrackEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<VideoInfo>(line) {
            Ok(info) => Some(TrackEntry::from(info)),
            Err(e) => {
                debug!("Skipping search result: {}", e);
                None
            }
        })
        .collect()
}

/// Resolver backed by the `yt-dlp` command line tool
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    program: PathBuf,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Run the tool and return its stdout
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String, ResolveError> {
        let output = Command::new(&self.program)
            .args(args)
            .args(["--no-warnings", "--quiet"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, output).await {
            Ok(result) => result.map_err(ResolveError::NotFound)?,
            Err(_) => return Err(ResolveError::Timeout(timeout)),
        };

        if !output.status.success() && output.stdout.is_empty() {
            return Err(ResolveError::Failed(output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLVER)
    }
}

#[async_trait]
impl StreamResolver for YtDlpResolver {
    #[instrument(skip(self))]
    async fn search(&self, query: &str, count: usize) -> Vec<TrackEntry> {
        let target = format!("ytsearch{}:{}", count, query);
        match self
            .run(&[target.as_str(), "--dump-json", "--flat-playlist"], SEARCH_TIMEOUT)
            .await
        {
            Ok(stdout) => parse_entries(&stdout),
            Err(e) => {
                warn!("Search failed: {}", e);
                Vec::new()
            }
        }
    }

    #[instrument(skip(self, entry), fields(id = %entry.id))]
    async fn stream_url(&self, entry: &TrackEntry) -> Option<String> {
        let page = watch_url(&entry.id);
        match self.run(&["-f", "bestaudio", "-g", page.as_str()], STREAM_TIMEOUT).await {
            Ok(stdout) => stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string),
            Err(e) => {
                warn!("Stream resolution failed: {}", e);
                None
            }
        }
    }

    #[instrument(skip(self))]
    async fn lookup(&self, url: &str) -> TrackEntry {
        let parsed = match self.run(&["--dump-json", url], LOOKUP_TIMEOUT).await {
            Ok(stdout) if !stdout.trim().is_empty() => {
                serde_json::from_str::<VideoInfo>(stdout.trim()).map_err(ResolveError::from)
            }
            Ok(_) => {
                debug!("Lookup produced no output");
                return TrackEntry::new(url, url);
            }
            Err(e) => Err(e),
        };

        match parsed {
            Ok(info) => info.into(),
            Err(e) => {
                debug!("Lookup failed, using URL as title: {}", e);
                TrackEntry::new(url, url)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_url() {
        assert_eq!(watch_url("dQw4w9WgXcQ"), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(watch_url("https://example.com/a"), "https://example.com/a");
    }

    #[test]
    fn test_parse_entries() {
        let output = concat!(
            r#"{"id":"a1","title":"First","channel":"Chan","duration":215.0,"view_count":9}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"id":"b2","uploader":"Someone","duration":null}"#,
            "\n",
        );
        let entries = parse_entries(output);
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].id, "a1");
        assert_eq!(entries[0].title, "First");
        assert_eq!(entries[0].channel.as_deref(), Some("Chan"));
        assert_eq!(entries[0].duration, Some(215.0));

        // Missing title falls back to the id
        assert_eq!(entries[1].title, "b2");
        assert_eq!(entries[1].channel.as_deref(), Some("Someone"));
        assert_eq!(entries[1].duration, None);
    }

    #[tokio::test]
    async fn test_missing_tool_degrades() {
        let resolver = YtDlpResolver::new("/nonexistent/yt-dlp");

        assert!(resolver.search("anything", 5).await.is_empty());
        assert_eq!(resolver.stream_url(&TrackEntry::new("a1", "A")).await, None);

        let entry = resolver.lookup("https://example.com/x").await;
        assert_eq!(entry, TrackEntry::new("https://example.com/x", "https://example.com/x"));
    }

    #[tokio::test]
    async fn test_failing_tool_degrades() {
        // `false` exits non-zero without output
        let resolver = YtDlpResolver::new("false");
        assert!(resolver.search("anything", 5).await.is_empty());
        assert_eq!(resolver.stream_url(&TrackEntry::new("a1", "A")).await, None);
        assert_eq!(resolver.lookup("u").await, TrackEntry::new("u", "u"));
    }
}
