//! Host and peer sessions
//!
//! A [`HostSession`] owns the authoritative queue, drives the media engine and,
//! when serving, fans snapshots out to peers. A [`PeerSession`] mirrors a
//! remote host and forwards additions to it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::engine::MediaEngine;
use crate::network::{BroadcastServer, NetworkConfig, NetworkError, PeerClient, ServerEvent};
use crate::resolve::StreamResolver;
use crate::sync::{HostState, PeerMirror, PlaybackSnapshot, TrackEntry};

/// What one host tick produced
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub snapshot: PlaybackSnapshot,
    /// Connected peers, 0 when not serving
    pub clients: usize,
}

/// Playback authority: local queue, engine and optional broadcast server
pub struct HostSession {
    state: Arc<Mutex<HostState>>,
    engine: Arc<MediaEngine>,
    resolver: Arc<dyn StreamResolver>,
    server: Option<Arc<BroadcastServer>>,
    /// In-flight `play_entry`, superseded by the next one
    play_task: Mutex<Option<AbortHandle>>,
    /// Bumped by every `play_entry` so a superseded load can't finish
    play_generation: Arc<AtomicU64>,
    event_task: Option<JoinHandle<()>>,
}

impl HostSession {
    pub fn new(engine: MediaEngine, resolver: Arc<dyn StreamResolver>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState::default())),
            engine: Arc::new(engine),
            resolver,
            server: None,
            play_task: Mutex::new(None),
            play_generation: Arc::new(AtomicU64::new(0)),
            event_task: None,
        }
    }

    /// Start accepting peers on `port`. Their additions land in our queue.
    pub async fn serve(&mut self, port: u16, config: NetworkConfig) -> Result<SocketAddr, NetworkError> {
        if let Some(server) = &self.server {
            return server.local_addr();
        }

        let (server, events) = BroadcastServer::new(port, config);
        let addr = server.start().await?;

        self.event_task = Some(tokio::spawn(handle_server_events(
            events,
            Arc::clone(&self.state),
        )));
        self.server = Some(Arc::new(server));
        Ok(addr)
    }

    pub fn engine(&self) -> &MediaEngine {
        &self.engine
    }

    pub fn resolver(&self) -> &Arc<dyn StreamResolver> {
        &self.resolver
    }

    pub fn is_serving(&self) -> bool {
        self.server.is_some()
    }

    pub fn client_count(&self) -> usize {
        self.server.as_ref().map(|s| s.client_count()).unwrap_or(0)
    }

    pub fn enqueue(&self, entry: TrackEntry) {
        info!("Queued: {}", entry.title);
        self.state.lock().queue.push(entry);
    }

    pub fn remove(&self, index: usize) -> Option<TrackEntry> {
        self.state.lock().queue.remove(index)
    }

    pub fn queue(&self) -> Vec<TrackEntry> {
        self.state.lock().queue.to_vec()
    }

    pub fn now_playing(&self) -> Option<TrackEntry> {
        self.state.lock().track.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    /// Make `entry` the current track and start it in the background.
    /// Supersedes any earlier load that hasn't finished.
    pub fn play_entry(&self, entry: TrackEntry) {
        let generation = self.play_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().begin_loading(entry.clone());

        let state = Arc::clone(&self.state);
        let engine = Arc::clone(&self.engine);
        let resolver = Arc::clone(&self.resolver);
        let current = Arc::clone(&self.play_generation);

        let task = tokio::spawn(async move {
            info!("Loading: {}", entry.title);
            let ok = match resolver.stream_url(&entry).await {
                Some(url) => engine.play(&url, &entry.title).await,
                None => {
                    warn!("No audio stream for {}", entry.title);
                    false
                }
            };

            if current.load(Ordering::SeqCst) != generation {
                debug!("Load of {} was superseded", entry.title);
                return;
            }
            state.lock().finish_loading(ok);
            if ok {
                info!("Now playing: {}", entry.title);
            }
        });

        if let Some(previous) = self.play_task.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }

    /// Play the head of the queue. `false` when the queue is empty.
    pub fn next(&self) -> bool {
        let entry = self.state.lock().queue.pop();
        match entry {
            Some(entry) => {
                self.play_entry(entry);
                true
            }
            None => false,
        }
    }

    /// Take the entry at `index` out of the queue and play it
    pub fn play_from_queue(&self, index: usize) -> bool {
        let entry = self.state.lock().queue.remove(index);
        match entry {
            Some(entry) => {
                self.play_entry(entry);
                true
            }
            None => false,
        }
    }

    pub async fn toggle_pause(&self) {
        if self.engine.is_running() {
            self.engine.toggle_pause().await;
        }
    }

    pub async fn seek(&self, delta_seconds: f64) {
        if self.engine.is_running() {
            self.engine.seek(delta_seconds).await;
        }
    }

    pub async fn set_volume(&self, volume: f64) {
        if self.engine.is_running() {
            self.engine.set_volume(volume).await;
        }
    }

    /// Advance past finished tracks, sample the engine and broadcast the result
    pub async fn tick(&self) -> TickReport {
        let ended = {
            let mut state = self.state.lock();
            if state.track.is_some() && !state.loading && !self.engine.is_running() {
                state.track.take()
            } else {
                None
            }
        };
        if let Some(track) = ended {
            info!("Finished: {}", track.title);
            self.next();
        }

        let has_track = self.state.lock().track.is_some();
        let (position, duration, paused) = if has_track {
            tokio::join!(
                self.engine.position(),
                self.engine.duration(),
                self.engine.paused()
            )
        } else {
            (0.0, 0.0, false)
        };

        let snapshot = self.state.lock().snapshot(position, duration, paused);
        let clients = match &self.server {
            Some(server) => {
                server.broadcast(&snapshot);
                server.client_count()
            }
            None => 0,
        };

        TickReport { snapshot, clients }
    }

    /// Stop playback and hosting
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.play_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.engine.stop().await;
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
        info!("Host session closed");
    }
}

/// Apply server events to the host state until the server goes away
async fn handle_server_events(
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    state: Arc<Mutex<HostState>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::PeerConnected { addr } => info!("Peer joined: {}", addr),
            ServerEvent::TrackAdded { from, entry } => {
                info!("{} queued: {}", from, entry.title);
                state.lock().queue.push(entry);
            }
            ServerEvent::PeerDisconnected { addr } => info!("Peer left: {}", addr),
        }
    }
}

/// Follows a remote host
pub struct PeerSession {
    client: Arc<PeerClient>,
    mirror: Arc<Mutex<PeerMirror>>,
    updates: Arc<watch::Sender<PeerMirror>>,
    snapshots: Mutex<Option<mpsc::UnboundedReceiver<PlaybackSnapshot>>>,
    apply_task: Mutex<Option<JoinHandle<()>>>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    pub fn new(host: impl Into<String>, port: u16, config: NetworkConfig) -> Self {
        let (client, snapshots) = PeerClient::new(host, port, config);
        let (updates, _) = watch::channel(PeerMirror::new());

        Self {
            client: Arc::new(client),
            mirror: Arc::new(Mutex::new(PeerMirror::new())),
            updates: Arc::new(updates),
            snapshots: Mutex::new(Some(snapshots)),
            apply_task: Mutex::new(None),
            listen_task: Mutex::new(None),
        }
    }

    /// Latest mirrored state, updated on every snapshot and on disconnect
    pub fn subscribe(&self) -> watch::Receiver<PeerMirror> {
        self.updates.subscribe()
    }

    pub fn mirror(&self) -> PeerMirror {
        self.mirror.lock().clone()
    }

    pub fn connected(&self) -> bool {
        self.client.connected()
    }

    /// Connect to the host and start following it
    pub async fn join(&self) -> bool {
        if !self.client.connect().await {
            return false;
        }

        if let Some(mut snapshots) = self.snapshots.lock().take() {
            let mirror = Arc::clone(&self.mirror);
            let updates = Arc::clone(&self.updates);
            let task = tokio::spawn(async move {
                while let Some(snapshot) = snapshots.recv().await {
                    let view = {
                        let mut mirror = mirror.lock();
                        mirror.apply(snapshot);
                        mirror.clone()
                    };
                    updates.send_replace(view);
                }
            });
            *self.apply_task.lock() = Some(task);
        }

        let client = Arc::clone(&self.client);
        let updates = Arc::clone(&self.updates);
        let task = tokio::spawn(async move {
            client.listen().await;
            // Wake watchers so they notice the disconnect
            updates.send_modify(|_| {});
        });
        if let Some(previous) = self.listen_task.lock().replace(task) {
            previous.abort();
        }
        true
    }

    /// Ask the host to queue `entry`
    pub async fn add(&self, entry: TrackEntry) {
        self.client.send_add(entry).await;
    }

    /// Disconnect from the host. Idempotent.
    pub async fn leave(&self) {
        self.client.close().await;
        let listen = self.listen_task.lock().take();
        if let Some(task) = listen {
            let _ = task.await;
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(task) = self.apply_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.listen_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;
    use std::time::Duration;

    /// Ids starting with "slow" never resolve, "none" has no stream,
    /// anything else resolves to a fake URL.
    struct FakeResolver;

    #[async_trait]
    impl StreamResolver for FakeResolver {
        async fn search(&self, query: &str, count: usize) -> Vec<TrackEntry> {
            (0..count)
                .map(|i| TrackEntry::new(format!("{}{}", query, i), format!("{} #{}", query, i)))
                .collect()
        }

        async fn stream_url(&self, entry: &TrackEntry) -> Option<String> {
            if entry.id.starts_with("slow") {
                futures::future::pending::<()>().await;
            }
            if entry.id.starts_with("none") {
                return None;
            }
            Some(format!("http://stream.invalid/{}", entry.id))
        }

        async fn lookup(&self, url: &str) -> TrackEntry {
            TrackEntry::new(url, url)
        }
    }

    fn host_session() -> HostSession {
        // The engine can never start, so every resolved play fails
        let engine = MediaEngine::new(EngineConfig {
            program: PathBuf::from("/nonexistent/jukebox-engine"),
            ..Default::default()
        });
        HostSession::new(engine, Arc::new(FakeResolver))
    }

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_queue_operations() {
        let host = host_session();
        assert!(!host.next());

        host.enqueue(TrackEntry::new("a", "A"));
        host.enqueue(TrackEntry::new("b", "B"));
        host.enqueue(TrackEntry::new("c", "C"));
        assert_eq!(host.remove(1), Some(TrackEntry::new("b", "B")));
        assert_eq!(host.remove(9), None);
        assert_eq!(
            host.queue(),
            vec![TrackEntry::new("a", "A"), TrackEntry::new("c", "C")]
        );
        assert!(!host.play_from_queue(5));
    }

    #[tokio::test]
    async fn test_unresolvable_track_is_cleared() {
        let host = host_session();
        host.play_entry(TrackEntry::new("none-1", "Missing"));
        assert_eq!(host.now_playing(), Some(TrackEntry::new("none-1", "Missing")));
        assert!(host.is_loading());

        wait_until(|| !host.is_loading()).await;
        assert_eq!(host.now_playing(), None);
    }

    #[tokio::test]
    async fn test_engine_failure_clears_track() {
        let host = host_session();
        host.enqueue(TrackEntry::new("ok-1", "Playable"));
        assert!(host.next());
        assert!(host.queue().is_empty());

        wait_until(|| !host.is_loading()).await;
        assert_eq!(host.now_playing(), None);
        assert!(!host.engine().is_running());
    }

    #[tokio::test]
    async fn test_newer_play_supersedes_older() {
        let host = host_session();
        host.play_entry(TrackEntry::new("slow-1", "Slow"));
        host.play_entry(TrackEntry::new("none-2", "Second"));

        wait_until(|| !host.is_loading()).await;
        assert_eq!(host.now_playing(), None);
    }

    #[tokio::test]
    async fn test_superseding_load_while_stopping() {
        let script = crate::engine::stubborn_engine_script();
        let engine = MediaEngine::new(EngineConfig {
            program: script.clone(),
            socket_poll_interval: Duration::from_millis(20),
            stop_grace: Duration::from_secs(5),
            ..Default::default()
        });
        let host = HostSession::new(engine, Arc::new(FakeResolver));

        // First engine starts but never attaches, so it is left running
        host.play_entry(TrackEntry::new("a", "A"));
        wait_until(|| !host.is_loading()).await;
        let first_socket = host.engine().socket_path().unwrap();
        assert!(first_socket.exists());

        // The second load sits in the grace period of the first engine's stop
        host.play_entry(TrackEntry::new("b", "B"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        host.play_entry(TrackEntry::new("c", "C"));

        wait_until(|| !first_socket.exists()).await;
        wait_until(|| !host.is_loading()).await;
        assert_ne!(host.engine().socket_path(), Some(first_socket));

        drop(host);
        let _ = std::fs::remove_file(&script);
    }

    #[tokio::test]
    async fn test_tick_advances_finished_track() {
        let host = host_session();
        host.state.lock().track = Some(TrackEntry::new("done", "Done"));
        host.enqueue(TrackEntry::new("slow-next", "Next"));

        let report = host.tick().await;
        assert_eq!(report.snapshot.track, Some(TrackEntry::new("slow-next", "Next")));
        assert!(report.snapshot.queue.is_empty());
        assert!(host.is_loading());
        assert_eq!(report.clients, 0);

        // Still loading, so the next tick leaves it alone
        let report = host.tick().await;
        assert_eq!(report.snapshot.track, Some(TrackEntry::new("slow-next", "Next")));
    }

    #[tokio::test]
    async fn test_tick_with_empty_queue_clears_track() {
        let host = host_session();
        host.state.lock().track = Some(TrackEntry::new("done", "Done"));

        let report = host.tick().await;
        assert_eq!(report.snapshot.track, None);
        assert_eq!(report.snapshot.position, 0.0);
    }

    #[tokio::test]
    async fn test_controls_ignored_without_engine() {
        let host = host_session();
        host.toggle_pause().await;
        host.seek(10.0).await;
        host.set_volume(50.0).await;
        assert!(!host.engine().is_running());
    }

    #[tokio::test]
    async fn test_peer_follows_host() {
        let mut host = host_session();
        let addr = host.serve(0, local_config()).await.unwrap();
        assert!(host.is_serving());
        host.enqueue(TrackEntry::new("q1", "Queued"));

        let peer = PeerSession::new("127.0.0.1", addr.port(), local_config());
        let mut updates = peer.subscribe();
        assert!(peer.join().await);

        // Remote additions land in the host queue
        peer.add(TrackEntry::new("p1", "From peer")).await;
        wait_until(|| host.queue().len() == 2).await;
        assert_eq!(host.client_count(), 1);

        let report = host.tick().await;
        assert_eq!(report.clients, 1);

        tokio::time::timeout(Duration::from_secs(2), updates.wait_for(|m| m.queue.len() == 2))
            .await
            .unwrap()
            .unwrap();
        let mirror = peer.mirror();
        assert_eq!(mirror.queue.to_vec(), host.queue());
        assert_eq!(mirror.track, None);

        peer.leave().await;
        peer.leave().await;
        assert!(!peer.connected());

        host.shutdown().await;
        assert!(!host.is_serving());
    }

    #[tokio::test]
    async fn test_peer_sees_host_shutdown() {
        let mut host = host_session();
        let addr = host.serve(0, local_config()).await.unwrap();

        let peer = PeerSession::new("127.0.0.1", addr.port(), local_config());
        let mut updates = peer.subscribe();
        assert!(peer.join().await);
        wait_until(|| host.client_count() == 1).await;

        host.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .unwrap()
            .unwrap();
        wait_until(|| !peer.connected()).await;
    }

    #[tokio::test]
    async fn test_join_unreachable_host() {
        let peer = PeerSession::new("127.0.0.1", 1, local_config());
        assert!(!peer.join().await);
        assert!(!peer.connected());
    }
}
