//! Server-side TCP transport.
//!
//! Each accepted connection gets a reader task and a writer task. The
//! reader forwards raw bytes to the connection's [`Link`]; framing is the
//! caller's business. The writer drains a bounded queue of encoded frames
//! and interleaves keepalive pings. Neither task retries anything: on EOF,
//! read error, or keepalive timeout the link reports [`Inbound::Closed`]
//! and both tasks stop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::command::ConnectionId;
use crate::error::LoopError;
use crate::message::Message;

const READ_CHUNK: usize = 8 * 1024;

// ── Options ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Connections beyond this are accepted and immediately dropped.
    pub max_connections: usize,
    /// Period between keepalive pings.
    pub keepalive_interval: Duration,
    /// Silent intervals tolerated before the peer is declared dead.
    pub keepalive_misses: u32,
    /// Bound on frames waiting to be written per connection.
    pub write_buffer_frames: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_connections: 16,
            keepalive_interval: Duration::from_secs(5),
            keepalive_misses: 3,
            write_buffer_frames: 256,
        }
    }
}

impl TransportOptions {
    fn read_deadline(&self) -> Duration {
        self.keepalive_interval * self.keepalive_misses.max(1)
    }
}

// ── Outbound ─────────────────────────────────────────────────────

/// Raised by a sender that found the write buffer full; the writer
/// answers with a notification once it takes the next frame.
#[derive(Debug, Default)]
struct WriteSignal {
    stalled: AtomicBool,
    drained: Notify,
}

impl WriteSignal {
    fn frame_taken(&self) {
        if self.stalled.swap(false, Ordering::SeqCst) {
            self.drained.notify_one();
        }
    }
}

/// Non-blocking handle for queueing frames on one connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
    signal: Arc<WriteSignal>,
    cancel: CancellationToken,
}

impl Outbound {
    /// Build a detached handle and the receiving end of its buffer.
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbound = Self {
            id,
            tx,
            signal: Arc::default(),
            cancel: CancellationToken::new(),
        };
        (outbound, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue raw bytes. Never waits.
    ///
    /// On [`LoopError::BackpressureExceeded`] the next frame the writer
    /// takes wakes [`drained`](Self::drained).
    pub fn send(&self, bytes: Bytes) -> Result<(), LoopError> {
        match self.tx.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(bytes)) => {
                // Armed before the retry so a frame taken in between still wakes.
                self.signal.stalled.store(true, Ordering::SeqCst);
                self.tx.try_send(bytes).map_err(|e| self.send_error(e))
            }
            Err(e) => Err(self.send_error(e)),
        }
    }

    fn send_error(&self, e: mpsc::error::TrySendError<Bytes>) -> LoopError {
        match e {
            mpsc::error::TrySendError::Full(_) => LoopError::BackpressureExceeded(self.id),
            mpsc::error::TrySendError::Closed(_) => LoopError::ConnectionClosed(self.id),
        }
    }

    /// Encode and queue one message.
    pub fn send_message(&self, message: &Message) -> Result<(), LoopError> {
        let frame = codec::encode(message)?;
        self.send(Bytes::from(frame))
    }

    /// Resolves once the writer has made room after a full-buffer send.
    pub async fn drained(&self) {
        self.signal.drained.notified().await
    }

    /// Stop the connection. Frames already queued are still written.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }
}

// ── Link ─────────────────────────────────────────────────────────

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Eof,
    ReadError(String),
    KeepaliveTimeout,
    /// Closed by this process.
    Local,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eof => write!(f, "peer closed the connection"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::KeepaliveTimeout => write!(f, "keepalive timeout"),
            Self::Local => write!(f, "closed locally"),
        }
    }
}

/// Event delivered from the reader task.
#[derive(Debug)]
pub enum Inbound {
    Data(Bytes),
    Closed(CloseReason),
}

/// One accepted connection as seen by the layer above.
#[derive(Debug)]
pub struct Link {
    id: ConnectionId,
    remote: SocketAddr,
    outbound: Outbound,
    inbound: mpsc::Receiver<Inbound>,
}

impl Link {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Next chunk of bytes, or the close notification. `None` after close.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Stop both tasks. Frames already queued are still written.
    pub fn close(&self) {
        self.outbound.close();
    }
}

// ── Transport ────────────────────────────────────────────────────

type PeerMap = Arc<Mutex<HashMap<ConnectionId, Outbound>>>;

pub struct Transport {
    listener: TcpListener,
    options: TransportOptions,
    peers: PeerMap,
    next_id: AtomicU64,
}

impl Transport {
    pub async fn bind(addr: &str, options: TransportOptions) -> Result<Self, LoopError> {
        let listener = TcpListener::bind(addr).await?;
        info!("transport listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            options,
            peers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LoopError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn connection_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Queue bytes on connection `id`.
    pub fn send(&self, id: ConnectionId, bytes: Bytes) -> Result<(), LoopError> {
        let outbound = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(LoopError::ConnectionClosed(id))?;
        outbound.send(bytes)
    }

    /// Wait for the next connection within the connection limit.
    pub async fn accept(&self) -> Result<Link, LoopError> {
        loop {
            let (stream, remote) = self.listener.accept().await?;
            if self.connection_count() >= self.options.max_connections {
                warn!(
                    "rejecting {remote}: {} connections already open",
                    self.options.max_connections
                );
                drop(stream);
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {remote}: {e}");
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            info!("connection {id} accepted from {remote}");
            return Ok(self.spawn_link(id, remote, stream));
        }
    }

    fn spawn_link(&self, id: ConnectionId, remote: SocketAddr, stream: TcpStream) -> Link {
        let (read_half, write_half) = stream.into_split();
        let (outbound, frames_rx) = Outbound::channel(id, self.options.write_buffer_frames);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let cancel = outbound.cancel.clone();

        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, outbound.clone());

        tokio::spawn(write_loop(
            id,
            write_half,
            frames_rx,
            Arc::clone(&outbound.signal),
            self.options.keepalive_interval,
            cancel.clone(),
        ));
        tokio::spawn(read_loop(
            id,
            read_half,
            inbound_tx,
            self.options.read_deadline(),
            cancel.clone(),
            Arc::clone(&self.peers),
        ));

        Link {
            id,
            remote,
            outbound,
            inbound: inbound_rx,
        }
    }
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    inbound: mpsc::Sender<Inbound>,
    deadline: Duration,
    cancel: CancellationToken,
    peers: PeerMap,
) {
    let reason = loop {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let read = tokio::select! {
            _ = cancel.cancelled() => break CloseReason::Local,
            read = tokio::time::timeout(deadline, reader.read_buf(&mut buf)) => read,
        };
        match read {
            Err(_) => break CloseReason::KeepaliveTimeout,
            Ok(Ok(0)) => break CloseReason::Eof,
            Ok(Ok(_)) => {
                if inbound.send(Inbound::Data(buf.freeze())).await.is_err() {
                    break CloseReason::Local;
                }
            }
            Ok(Err(e)) => break CloseReason::ReadError(e.to_string()),
        }
    };

    debug!("connection {id} reader stopped: {reason}");
    peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    cancel.cancel();
    let _ = inbound.send(Inbound::Closed(reason)).await;
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Bytes>,
    signal: Arc<WriteSignal>,
    keepalive: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut nonce = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush what was queued before the close.
                while let Ok(frame) = frames.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            frame = frames.recv() => match frame {
                Some(frame) => {
                    signal.frame_taken();
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!("connection {id} write error: {e}");
                        break;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                nonce = nonce.wrapping_add(1);
                let ping = match codec::encode(&Message::Ping { nonce }) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("connection {id} keepalive encode failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&ping).await {
                    warn!("connection {id} keepalive write error: {e}");
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    cancel.cancel();
    debug!("connection {id} writer stopped");
}
