//! Broadcast Server (host role)
//!
//! Accepts peer connections, ingests queue additions and fans out
//! playback snapshots. Delivery is best-effort: a peer that cannot keep up
//! or whose socket fails is pruned, never retried.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{NetworkConfig, NetworkError};
use crate::sync::{encode, read_frame, Message, PlaybackSnapshot, TrackEntry};

/// An encoded frame shared by every peer it is sent to
type Frame = Arc<[u8]>;

type ConnectionId = u64;

/// Events emitted by the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PeerConnected { addr: SocketAddr },
    /// A peer contributed a valid track. Already acknowledged.
    TrackAdded { from: SocketAddr, entry: TrackEntry },
    PeerDisconnected { addr: SocketAddr },
}

/// A live peer connection and its outbound sink
struct PeerConnection {
    addr: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerConnection {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// State shared between the server handle and its connection tasks
struct Shared {
    config: NetworkConfig,
    registry: Mutex<HashMap<ConnectionId, PeerConnection>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    next_id: AtomicU64,
}

impl Shared {
    /// Drop a connection from the registry and release its tasks.
    /// Safe to call more than once for the same id.
    fn remove(&self, id: ConnectionId) -> bool {
        let conn = self.registry.lock().remove(&id);
        match conn {
            Some(conn) => {
                info!("Peer disconnected: {}", conn.addr);
                let _ = self
                    .event_tx
                    .send(ServerEvent::PeerDisconnected { addr: conn.addr });
                conn.abort();
                true
            }
            None => false,
        }
    }
}

/// TCP server that broadcasts host state to connected peers
pub struct BroadcastServer {
    port: u16,
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl BroadcastServer {
    /// Create a server for `port`. Nothing is bound until [`start`](Self::start).
    pub fn new(
        port: u16,
        config: NetworkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let server = Self {
            port,
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(HashMap::new()),
                event_tx,
                next_id: AtomicU64::new(1),
            }),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        };

        (server, event_rx)
    }

    /// Configured port (0 means "any free port")
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address we are actually listening on
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.local_addr.lock().ok_or(NetworkError::NotStarted)
    }

    /// Begin accepting connections. Calling it again while running is a no-op.
    #[instrument(skip(self), fields(port = self.port))]
    pub async fn start(&self) -> Result<SocketAddr, NetworkError> {
        if let Some(addr) = *self.local_addr.lock() {
            return Ok(addr);
        }

        let addr = SocketAddr::new(self.shared.config.bind_addr, self.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("Jukebox server listening on {}", local_addr);

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(accept_loop(listener, shared));

        *self.accept_task.lock() = Some(task);
        *self.local_addr.lock() = Some(local_addr);
        Ok(local_addr)
    }

    /// Send a snapshot to every connected peer. Fire-and-forget.
    ///
    /// Peers whose sink is closed or full are pruned once the pass is done.
    /// Returns how many peers the frame was queued for.
    pub fn broadcast(&self, snapshot: &PlaybackSnapshot) -> usize {
        self.broadcast_message(&Message::Sync(snapshot.clone()))
    }

    fn broadcast_message(&self, msg: &Message) -> usize {
        let frame: Frame = encode(msg).into();
        let mut delivered = 0;
        let mut dead = Vec::new();

        {
            let registry = self.shared.registry.lock();
            if registry.is_empty() {
                return 0;
            }

            for (id, conn) in registry.iter() {
                match conn.outbound.try_send(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Peer {} is not keeping up, dropping it", conn.addr);
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Peer {} sink closed", conn.addr);
                        dead.push(*id);
                    }
                }
            }
        }

        for id in dead {
            self.shared.remove(id);
        }
        delivered
    }

    /// Number of live connections right now
    pub fn client_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Stop accepting, terminate every handler and close every connection.
    /// Safe to call when the server was never started.
    pub async fn stop(&self) {
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            task.abort();
            let _ = task.await;
            info!("Jukebox server stopped accepting");
        }
        *self.local_addr.lock() = None;

        let connections: Vec<PeerConnection> = self
            .shared
            .registry
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        if connections.is_empty() {
            return;
        }

        let mut tasks = Vec::with_capacity(connections.len() * 2);
        for conn in connections {
            conn.abort();
            tasks.push(conn.reader);
            tasks.push(conn.writer);
        }
        // Aborted tasks drop their socket halves when they finish
        futures::future::join_all(tasks).await;
        info!("Closed all peer connections");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => register(&shared, stream, addr),
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Put a fresh connection in the registry and spawn its reader and writer
fn register(shared: &Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }

    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.outbound_capacity);

    // Insert under the lock so a handler that exits at once can't race the insert
    let mut registry = shared.registry.lock();
    let writer = tokio::spawn(write_loop(
        Arc::clone(shared),
        id,
        addr,
        write_half,
        outbound_rx,
    ));
    let reader = tokio::spawn(handle_peer(
        Arc::clone(shared),
        id,
        addr,
        read_half,
        outbound_tx.clone(),
    ));
    registry.insert(
        id,
        PeerConnection {
            addr,
            outbound: outbound_tx,
            reader,
            writer,
        },
    );
}

/// Read frames from one peer until it goes quiet, closes or sends garbage
async fn handle_peer(
    shared: Arc<Shared>,
    id: ConnectionId,
    addr: SocketAddr,
    read_half: OwnedReadHalf,
    outbound: mpsc::Sender<Frame>,
) {
    info!("Peer connected: {}", addr);
    let _ = shared.event_tx.send(ServerEvent::PeerConnected { addr });

    let mut reader = BufReader::new(read_half);
    while let Some(msg) = read_frame(&mut reader, shared.config.read_timeout).await {
        match msg {
            Message::Add { entry } if entry.is_valid() => {
                info!("Peer {} added: {}", addr, entry.title);
                let ack: Frame = encode(&Message::Ack {
                    title: entry.title.clone(),
                })
                .into();
                let _ = shared
                    .event_tx
                    .send(ServerEvent::TrackAdded { from: addr, entry });
                if outbound.try_send(ack).is_err() {
                    debug!("Could not queue ack for {}", addr);
                }
            }
            Message::Add { .. } => {
                debug!("Ignoring add without id/title from {}", addr);
            }
            Message::Hello => debug!("Hello from {}", addr),
            other => debug!("Ignoring {} from {}", other.kind(), addr),
        }
    }

    shared.remove(id);
}

/// Drain the peer's outbound sink onto its socket
async fn write_loop(
    shared: Arc<Shared>,
    id: ConnectionId,
    addr: SocketAddr,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
) {
    let write_timeout = shared.config.write_timeout;
    while let Some(frame) = outbound.recv().await {
        match tokio::time::timeout(write_timeout, write_half.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write to {} failed: {}", addr, e);
                break;
            }
            Err(_) => {
                warn!("Write to {} timed out", addr);
                break;
            }
        }
    }
    shared.remove(id);
}
