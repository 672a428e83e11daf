//! Peer Client (joiner role)
//!
//! Connects to a host, sends queue additions and receives snapshots.
//! Transport failures never surface as errors; they flip `connected` off.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::NetworkConfig;
use crate::sync::{encode, read_frame, Message, PlaybackSnapshot, TrackEntry};

/// TCP client that connects to a host and receives state updates
pub struct PeerClient {
    host: String,
    port: u16,
    config: NetworkConfig,
    connected: AtomicBool,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    sync_tx: mpsc::UnboundedSender<PlaybackSnapshot>,
    /// Set to true by `close` to abandon an in-progress `listen`
    shutdown: watch::Sender<bool>,
}

impl PeerClient {
    /// Create a client for `host:port`. Snapshots from the host arrive on
    /// the returned receiver while [`listen`](Self::listen) runs.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        config: NetworkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackSnapshot>) {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let client = Self {
            host: host.into(),
            port,
            config,
            connected: AtomicBool::new(false),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            sync_tx,
            shutdown,
        };

        (client, sync_rx)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect and announce ourselves. Returns `false` on any transport failure.
    #[instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub async fn connect(&self) -> bool {
        let target = format!("{}:{}", self.host, self.port);

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&target),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", target, e);
                return false;
            }
            Err(_) => {
                warn!("Connecting to {} timed out", target);
                return false;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (read_half, mut write_half) = stream.into_split();

        let hello = encode(&Message::Hello);
        match tokio::time::timeout(self.config.write_timeout, write_half.write_all(&hello)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Failed to greet {}: {}", target, e);
                return false;
            }
            Err(_) => {
                warn!("Greeting {} timed out", target);
                return false;
            }
        }

        *self.reader.lock().await = Some(BufReader::new(read_half));
        *self.writer.lock().await = Some(write_half);
        self.shutdown.send_replace(false);
        self.connected.store(true, Ordering::SeqCst);

        info!("Connected to host {}", target);
        true
    }

    /// Read frames until the host goes away or [`close`](Self::close) is called.
    /// Each snapshot is forwarded to the receiver returned by [`new`](Self::new).
    pub async fn listen(&self) {
        let Some(mut reader) = self.reader.lock().await.take() else {
            self.connected.store(false, Ordering::SeqCst);
            return;
        };
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            // The read future lives across keepalive ticks, so a frame that
            // arrives in pieces is never dropped half-read.
            let read = read_frame(&mut reader, self.config.read_timeout);
            tokio::pin!(read);

            let frame = loop {
                tokio::select! {
                    frame = &mut read => break frame,
                    _ = keepalive.tick() => {
                        if !self.send(Message::Hello).await {
                            break None;
                        }
                    }
                    _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break None,
                }
            };

            match frame {
                Some(Message::Sync(snapshot)) => {
                    if self.sync_tx.send(snapshot).is_err() {
                        debug!("Snapshot receiver dropped");
                    }
                }
                Some(Message::Ack { title }) => debug!("Host accepted: {}", title),
                Some(other) => debug!("Ignoring {} from host", other.kind()),
                None => break,
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from host {}:{}", self.host, self.port);
    }

    /// Ask the host to append `entry` to its queue. Failures only mark us
    /// disconnected.
    pub async fn send_add(&self, entry: TrackEntry) {
        self.send(Message::Add { entry }).await;
    }

    async fn send(&self, msg: Message) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(write_half) = writer.as_mut() else {
            return false;
        };
        if !self.connected() {
            return false;
        }

        let frame = encode(&msg);
        match tokio::time::timeout(self.config.write_timeout, write_half.write_all(&frame)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => warn!("Failed to send {}: {}", msg.kind(), e),
            Err(_) => warn!("Sending {} timed out", msg.kind()),
        }
        self.connected.store(false, Ordering::SeqCst);
        *writer = None;
        false
    }

    /// Release the connection. Idempotent.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        if let Some(mut write_half) = self.writer.lock().await.take() {
            if let Err(e) = write_half.shutdown().await {
                debug!("Shutdown of write half failed: {}", e);
            }
        }
        self.reader.lock().await.take();
    }
}
