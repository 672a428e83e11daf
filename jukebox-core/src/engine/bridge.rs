//! Engine process lifecycle and command exchange
//!
//! All command traffic goes through one lock around "write request, wait for
//! the next non-event frame". A single reader task per socket splits incoming
//! frames into replies (handed to the waiting caller) and notifications
//! (published on a broadcast channel).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};

use super::types::*;
use super::{EngineConfig, EngineError};

/// How long `stop` spends trying to deliver a quit request
const QUIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Notification backlog kept for slow subscribers
const EVENT_CAPACITY: usize = 64;

/// Lifecycle of the controlled engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    /// Process spawned, control socket not connected yet
    Starting,
    Connected,
}

/// One engine process and its control socket address. Dropping it removes
/// the socket file; the child is killed on drop.
struct MediaSession {
    id: SessionId,
    socket_path: PathBuf,
    child: Option<Child>,
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        remove_socket(&self.socket_path);
    }
}

/// The command side of a control connection
struct CommandChannel {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Value>,
    reader: AbortHandle,
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Controls one external playback engine at a time
pub struct MediaEngine {
    config: EngineConfig,
    session: parking_lot::Mutex<Option<MediaSession>>,
    channel: tokio::sync::Mutex<Option<CommandChannel>>,
    /// Reader task of the control connection, once established
    reader: parking_lot::Mutex<Option<AbortHandle>>,
    events: broadcast::Sender<EngineEvent>,
}

impl MediaEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            session: parking_lot::Mutex::new(None),
            channel: tokio::sync::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive the engine's unsolicited notifications
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// True while the spawned process exists and has not exited,
    /// whether or not the control socket is connected
    pub fn is_running(&self) -> bool {
        let mut session = self.session.lock();
        match session.as_mut().and_then(|s| s.child.as_mut()) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn state(&self) -> EngineState {
        if self.session.lock().is_none() {
            EngineState::Stopped
        } else if self.reader.lock().is_some() {
            EngineState::Connected
        } else {
            EngineState::Starting
        }
    }

    /// Control socket of the current session
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.session.lock().as_ref().map(|s| s.socket_path.clone())
    }

    /// Start playing `stream_url`, replacing any previous session.
    /// Returns `false` if the engine can't be spawned or never opens its socket.
    #[instrument(skip(self, stream_url))]
    pub async fn play(&self, stream_url: &str, title: &str) -> bool {
        self.stop().await;

        match self.start(stream_url, title).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Engine start failed: {}", e);
                false
            }
        }
    }

    async fn start(&self, stream_url: &str, title: &str) -> Result<(), EngineError> {
        let id = SessionId::generate();
        let socket_path = id.socket_path(&self.config.socket_dir);

        let child = Command::new(&self.config.program)
            .arg("--no-video")
            .arg("--no-terminal")
            .arg(format!("--input-ipc-server={}", socket_path.display()))
            .arg(format!("--title={}", title))
            .args(&self.config.extra_args)
            .arg("--")
            .arg(stream_url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        info!(session = id.as_str(), "Engine spawned");
        *self.session.lock() = Some(MediaSession {
            id,
            socket_path: socket_path.clone(),
            child: Some(child),
        });

        // The process is left running on failure; the next play/stop reconciles it
        self.wait_for_socket(&socket_path).await?;
        self.attach(&socket_path).await
    }

    async fn wait_for_socket(&self, socket_path: &Path) -> Result<(), EngineError> {
        for _ in 0..self.config.socket_poll_attempts {
            if tokio::fs::try_exists(socket_path).await.unwrap_or(false) {
                return Ok(());
            }
            tokio::time::sleep(self.config.socket_poll_interval).await;
        }
        Err(EngineError::SocketTimeout(socket_path.to_path_buf()))
    }

    /// Open the control connection and start its reader
    async fn attach(&self, socket_path: &Path) -> Result<(), EngineError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(EngineError::Connect)?;
        let (read_half, writer) = stream.into_split();

        // Reader and channel are installed together, with no await in between
        let mut channel = self.channel.lock().await;
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, reply_tx, self.events.clone())).abort_handle();

        if let Some(previous) = self.reader.lock().replace(reader.clone()) {
            previous.abort();
        }
        *channel = Some(CommandChannel {
            writer,
            replies,
            reader,
        });

        debug!("Control socket connected: {}", socket_path.display());
        Ok(())
    }

    /// Send one command and wait for its reply, skipping notifications
    async fn command(&self, cmd: EngineCommand) -> Result<EngineReply, EngineError> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or(EngineError::NotConnected)?;

        // Replies whose caller already gave up
        loop {
            match channel.replies.try_recv() {
                Ok(stale) => debug!("Discarding stale engine reply: {}", stale),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    *guard = None;
                    return Err(EngineError::Closed);
                }
            }
        }

        let timeout = self.config.reply_timeout;
        match tokio::time::timeout(timeout, channel.writer.write_all(&cmd.to_frame())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                *guard = None;
                return Err(EngineError::Write(e));
            }
            Err(_) => return Err(EngineError::ReplyTimeout),
        }

        match tokio::time::timeout(timeout, channel.replies.recv()).await {
            Ok(Some(frame)) => Ok(serde_json::from_value(frame).unwrap_or_default()),
            Ok(None) => {
                *guard = None;
                Err(EngineError::Closed)
            }
            Err(_) => Err(EngineError::ReplyTimeout),
        }
    }

    /// Fire-and-forget command
    async fn send(&self, cmd: EngineCommand) {
        if let Err(e) = self.command(cmd).await {
            debug!("Engine command failed: {}", e);
        }
    }

    /// Read a property. `None` when the engine fails, times out or isn't connected.
    pub async fn get_property(&self, name: &str) -> Option<Value> {
        match self.command(EngineCommand::get_property(name)).await {
            Ok(reply) => reply.into_data(),
            Err(e) => {
                debug!("get_property {} failed: {}", name, e);
                None
            }
        }
    }

    /// Playback position in seconds. 0.0 when unavailable, which callers
    /// cannot tell apart from a real zero.
    pub async fn position(&self) -> f64 {
        self.get_property(PROP_POSITION)
            .await
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }

    /// Duration in seconds, 0.0 when unavailable
    pub async fn duration(&self) -> f64 {
        self.get_property(PROP_DURATION)
            .await
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }

    pub async fn paused(&self) -> bool {
        self.get_property(PROP_PAUSE)
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Volume percentage, 100.0 when unavailable
    pub async fn volume(&self) -> f64 {
        self.get_property(PROP_VOLUME)
            .await
            .and_then(|v| v.as_f64())
            .unwrap_or(100.0)
    }

    pub async fn toggle_pause(&self) {
        self.send(EngineCommand::cycle(PROP_PAUSE)).await;
    }

    /// Seek relative to the current position
    pub async fn seek(&self, delta_seconds: f64) {
        self.send(EngineCommand::seek_relative(delta_seconds)).await;
    }

    pub async fn set_volume(&self, volume: f64) {
        let volume = volume.clamp(VOLUME_MIN, VOLUME_MAX);
        self.send(EngineCommand::set_property(PROP_VOLUME, volume))
            .await;
    }

    /// Terminate the engine and clean up its socket. Never fails, and does not
    /// wait for an in-flight command: closing the socket makes it fail fast.
    pub async fn stop(&self) {
        let session = self.session.lock().take();

        // Fails any in-flight command without waiting for its lock
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Ok(mut channel) = self.channel.try_lock() {
            channel.take();
        }

        // From here on an abort still kills the child and removes the socket
        let Some(mut session) = session else {
            return;
        };

        if let Some(mut child) = session.child.take() {
            self.terminate(&mut child, &session.socket_path).await;
        }
        info!(session = session.id.as_str(), "Engine stopped");
    }

    async fn terminate(&self, child: &mut Child, socket_path: &Path) {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Engine already exited: {}", status);
                return;
            }
            Ok(None) => {}
            Err(e) => debug!("Could not poll engine process: {}", e),
        }

        let quit_sent = request_quit(socket_path).await;
        let signalled = child.id().is_some_and(send_sigterm);
        if quit_sent || signalled {
            match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
                Ok(_) => return,
                Err(_) => warn!(
                    "Engine did not exit within {:?}, killing it",
                    self.config.stop_grace
                ),
            }
        }

        if let Err(e) = child.kill().await {
            debug!("Kill failed: {}", e);
        }
    }
}

/// Split control-socket frames into replies and notifications
async fn read_loop(
    read_half: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Value>,
    events: broadcast::Sender<EngineEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let frame: Value = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Skipping undecodable engine frame: {}", e);
                        continue;
                    }
                };
                match EngineEvent::from_frame(&frame) {
                    Some(event) => {
                        let _ = events.send(event);
                    }
                    None => {
                        if replies.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                debug!("Engine closed the control socket");
                break;
            }
            Err(e) => {
                debug!("Control socket read failed: {}", e);
                break;
            }
        }
    }
}

/// Ask the engine to quit over a fresh connection, leaving the command lock alone
async fn request_quit(socket_path: &Path) -> bool {
    let attempt = async {
        let mut stream = UnixStream::connect(socket_path).await?;
        stream.write_all(&EngineCommand::quit().to_frame()).await?;
        Ok::<_, std::io::Error>(())
    };
    matches!(tokio::time::timeout(QUIT_TIMEOUT, attempt).await, Ok(Ok(())))
}

fn send_sigterm(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGTERM to {} failed: {}", pid, e);
            false
        }
    }
}

fn remove_socket(socket_path: &Path) {
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!("Removed {}", socket_path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {}: {}", socket_path.display(), e),
    }
}

/// Write an executable shell script that stands in for the engine
#[cfg(test)]
pub(crate) fn write_engine_script(body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::temp_dir().join(format!("jukebox-engine-{}.sh", SessionId::generate().as_str()));
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// An engine that creates a plain file where its socket should be, so it can
/// never be attached, and ignores SIGTERM
#[cfg(test)]
pub(crate) fn stubborn_engine_script() -> PathBuf {
    write_engine_script(
        r#"trap '' TERM
for arg in "$@"; do
  case "$arg" in --input-ipc-server=*) : > "${arg#--input-ipc-server=}" ;; esac
done
while :; do sleep 0.05; done"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::UnixListener;
    use tokio::task::JoinHandle;

    fn test_socket_path() -> PathBuf {
        let id = SessionId::generate();
        std::env::temp_dir().join(format!("jukebox-test-{}.sock", id.as_str()))
    }

    /// A stand-in engine: answers property reads after emitting a notification,
    /// records everything else. `duration` replies arrive late when `slow_duration`.
    fn fake_engine(
        path: &Path,
        slow_duration: Option<Duration>,
    ) -> (JoinHandle<()>, Arc<parking_lot::Mutex<Vec<Value>>>) {
        let listener = UnixListener::bind(path).unwrap();
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&received);

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let command = request["command"].as_array().unwrap().clone();
                log.lock().push(Value::Array(command.clone()));

                let reply = match (command[0].as_str(), command.get(1).and_then(|v| v.as_str())) {
                    (Some("get_property"), Some(PROP_POSITION)) => json!({"data": 42.5, "error": "success"}),
                    (Some("get_property"), Some(PROP_DURATION)) => {
                        if let Some(delay) = slow_duration {
                            tokio::time::sleep(delay).await;
                        }
                        json!({"data": 215.0, "error": "success"})
                    }
                    (Some("get_property"), Some(PROP_PAUSE)) => json!({"data": true, "error": "success"}),
                    (Some("get_property"), _) => json!({"error": "property unavailable"}),
                    _ => json!({"error": "success"}),
                };

                let event = json!({"event": "property-change", "name": "time-pos"});
                let mut out = serde_json::to_vec(&event).unwrap();
                out.push(b'\n');
                out.extend(serde_json::to_vec(&reply).unwrap());
                out.push(b'\n');
                if write_half.write_all(&out).await.is_err() {
                    break;
                }
            }
        });

        (task, received)
    }

    #[tokio::test]
    async fn test_defaults_when_not_connected() {
        let engine = MediaEngine::new(EngineConfig::default());
        assert_eq!(engine.position().await, 0.0);
        assert_eq!(engine.duration().await, 0.0);
        assert!(!engine.paused().await);
        assert_eq!(engine.volume().await, 100.0);
        assert!(!engine.is_running());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let engine = MediaEngine::new(EngineConfig::default());
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_play_with_missing_program() {
        let engine = MediaEngine::new(EngineConfig {
            program: PathBuf::from("/nonexistent/jukebox-engine"),
            ..Default::default()
        });
        assert!(!engine.play("http://example.invalid/stream", "Song").await);
        assert!(!engine.is_running());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_play_when_socket_never_appears() {
        // `true` ignores its arguments and exits without opening a socket
        let engine = MediaEngine::new(EngineConfig {
            program: PathBuf::from("true"),
            socket_poll_attempts: 3,
            socket_poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        assert!(!engine.play("http://example.invalid/stream", "Song").await);
        assert_eq!(engine.state(), EngineState::Starting);

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_commands_get_their_own_replies() {
        let path = test_socket_path();
        let (_fake, _log) = fake_engine(&path, None);

        let engine = Arc::new(MediaEngine::new(EngineConfig::default()));
        engine.attach(&path).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let e = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move { ("position", e.position().await) }));
            let e = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move { ("duration", e.duration().await) }));
        }

        for task in tasks {
            match task.await.unwrap() {
                ("position", value) => assert_eq!(value, 42.5),
                (_, value) => assert_eq!(value, 215.0),
            }
        }

        engine.stop().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_failed_property_yields_default() {
        let path = test_socket_path();
        let (_fake, _log) = fake_engine(&path, None);

        let engine = MediaEngine::new(EngineConfig::default());
        engine.attach(&path).await.unwrap();

        // The fake engine reports volume as unavailable
        assert_eq!(engine.volume().await, 100.0);
        assert!(engine.paused().await);

        engine.stop().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_reply_timeout_then_stale_reply_is_discarded() {
        let path = test_socket_path();
        let (_fake, _log) = fake_engine(&path, Some(Duration::from_millis(300)));

        let engine = MediaEngine::new(EngineConfig::default());
        engine.attach(&path).await.unwrap();

        // Known ambiguity: a timed-out read looks exactly like a zero duration
        assert_eq!(engine.duration().await, 0.0);

        // Let the late duration reply land, then make sure it isn't taken as ours
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.position().await, 42.5);

        engine.stop().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_mutators_send_commands() {
        let path = test_socket_path();
        let (_fake, log) = fake_engine(&path, None);

        let engine = MediaEngine::new(EngineConfig::default());
        engine.attach(&path).await.unwrap();

        engine.toggle_pause().await;
        engine.seek(-10.0).await;
        engine.set_volume(500.0).await;
        engine.set_volume(-3.0).await;

        assert_eq!(
            *log.lock(),
            vec![
                json!(["cycle", "pause"]),
                json!(["seek", -10.0, "relative"]),
                json!(["set_property", "volume", 150.0]),
                json!(["set_property", "volume", 0.0]),
            ]
        );

        engine.stop().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_notifications_are_published() {
        let path = test_socket_path();
        let (_fake, _log) = fake_engine(&path, None);

        let engine = MediaEngine::new(EngineConfig::default());
        let mut events = engine.subscribe_events();
        engine.attach(&path).await.unwrap();

        assert_eq!(engine.position().await, 42.5);
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name, "property-change");

        engine.stop().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_stop_fails_in_flight_command() {
        let path = test_socket_path();
        // Duration replies take far longer than the test waits
        let (_fake, _log) = fake_engine(&path, Some(Duration::from_secs(30)));

        let engine = Arc::new(MediaEngine::new(EngineConfig {
            reply_timeout: Duration::from_secs(10),
            ..Default::default()
        }));
        engine.attach(&path).await.unwrap();

        let e = Arc::clone(&engine);
        let pending = tokio::spawn(async move { e.duration().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.stop().await;
        let value = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 0.0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_stop_sends_sigterm() {
        let id = SessionId::generate();
        let marker = std::env::temp_dir().join(format!("jukebox-term-{}", id.as_str()));
        let ready = std::env::temp_dir().join(format!("jukebox-ready-{}", id.as_str()));
        let script = write_engine_script(&format!(
            "trap 'touch \"{}\"; exit 0' TERM\ntouch \"{}\"\nwhile :; do sleep 0.05; done",
            marker.display(),
            ready.display()
        ));

        // No socket ever appears, so `quit` can't be delivered
        let engine = MediaEngine::new(EngineConfig {
            program: script.clone(),
            socket_poll_attempts: 2,
            socket_poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        assert!(!engine.play("http://example.invalid/stream", "Song").await);

        for _ in 0..200 {
            if ready.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.is_running());

        engine.stop().await;
        assert!(marker.exists(), "engine was killed without a chance to exit");
        assert!(!engine.is_running());

        for path in [&marker, &ready, &script] {
            let _ = std::fs::remove_file(path);
        }
    }

    #[tokio::test]
    async fn test_aborted_stop_still_cleans_up() {
        let script = stubborn_engine_script();
        let engine = Arc::new(MediaEngine::new(EngineConfig {
            program: script.clone(),
            socket_poll_interval: Duration::from_millis(20),
            stop_grace: Duration::from_secs(5),
            ..Default::default()
        }));

        // The socket path is a plain file, so attaching fails
        assert!(!engine.play("http://example.invalid/stream", "Song").await);
        assert_eq!(engine.state(), EngineState::Starting);
        let socket = engine.socket_path().unwrap();
        assert!(socket.exists());

        let e = Arc::clone(&engine);
        let stopping = tokio::spawn(async move { e.stop().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stopping.is_finished());
        stopping.abort();
        let _ = stopping.await;

        assert!(!socket.exists());
        assert_eq!(engine.state(), EngineState::Stopped);
        let _ = std::fs::remove_file(&script);
    }
}
