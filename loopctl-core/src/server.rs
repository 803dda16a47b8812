//! Server orchestration: accept loop and per-connection tasks.
//!
//! Each accepted [`Link`] gets one task that reassembles frames, runs the
//! handshake and feeds commands to the [`SessionManager`]. The GUI side
//! is not touched here; it pulls from the shared queue through an
//! [`EventLoopBridge`](crate::bridge::EventLoopBridge).

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::BridgeOptions;
use crate::codec;
use crate::command::{Command, SessionId};
use crate::error::LoopError;
use crate::message::{Hello, Message, ResponseFrame, Status};
use crate::network::{Inbound, Link, Outbound, Transport, TransportOptions};
use crate::queue::CommandQueue;
use crate::session::{
    Admission, AllowAll, Authenticator, ConnectionRecord, SessionManager, SessionOptions,
    SharedToken,
};
use crate::state::ConnectionPhase;

/// Runtime options for a [`ControlServer`]. Plain data; the host binary
/// builds it from its config file.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_address: String,
    pub transport: TransportOptions,
    pub session: SessionOptions,
    pub queue_capacity: usize,
    pub bridge: BridgeOptions,
    pub worker_pool_size: usize,
    /// Longest the GUI loop sleeps when there is nothing to do.
    pub idle_tick: Duration,
    /// Require this token in every Hello when set.
    pub shared_token: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:7300".to_string(),
            transport: TransportOptions::default(),
            session: SessionOptions::default(),
            queue_capacity: 1024,
            bridge: BridgeOptions::default(),
            worker_pool_size: 4,
            idle_tick: Duration::from_millis(50),
            shared_token: None,
        }
    }
}

impl ServerOptions {
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        match &self.shared_token {
            Some(token) => Arc::new(SharedToken::new(token)),
            None => Arc::new(AllowAll),
        }
    }
}

pub struct ControlServer {
    transport: Transport,
    sessions: Arc<SessionManager>,
}

impl ControlServer {
    pub async fn bind(options: &ServerOptions) -> Result<Self, LoopError> {
        Self::bind_with(options, options.authenticator()).await
    }

    pub async fn bind_with(
        options: &ServerOptions,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, LoopError> {
        let transport = Transport::bind(&options.listen_address, options.transport.clone()).await?;
        let queue = Arc::new(CommandQueue::new(options.queue_capacity));
        let sessions = Arc::new(SessionManager::new(
            queue,
            authenticator,
            options.session.clone(),
        ));
        Ok(Self {
            transport,
            sessions,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, LoopError> {
        self.transport.local_addr()
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn queue(&self) -> Arc<CommandQueue> {
        Arc::clone(self.sessions.queue())
    }

    pub fn connection_count(&self) -> usize {
        self.transport.connection_count()
    }

    /// Accept connections until `stop` is cancelled.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), LoopError> {
        info!("control server listening on {}", self.local_addr()?);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("control server stopping");
                    break;
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(link) => {
                        let sessions = Arc::clone(&self.sessions);
                        let stop = stop.clone();
                        tokio::spawn(async move {
                            serve_link(link, sessions, stop).await;
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
        Ok(())
    }
}

// ── Per-connection task ──────────────────────────────────────────

enum Flow {
    Continue,
    /// Close the connection; `true` when the session already left.
    Close { goodbye: bool },
}

struct LinkTask {
    link: Link,
    outbound: Outbound,
    sessions: Arc<SessionManager>,
    phase: ConnectionPhase,
}

async fn serve_link(link: Link, sessions: Arc<SessionManager>, stop: CancellationToken) {
    let outbound = link.outbound();
    let mut task = LinkTask {
        link,
        outbound,
        sessions,
        phase: ConnectionPhase::accepted(),
    };
    let id = task.link.id();
    let mut buf = BytesMut::new();

    let goodbye = 'conn: loop {
        let inbound = tokio::select! {
            _ = stop.cancelled() => break 'conn false,
            _ = task.outbound.drained() => {
                task.sessions.flush(id);
                continue 'conn;
            }
            inbound = task.link.recv() => inbound,
        };
        let bytes = match inbound {
            Some(Inbound::Data(bytes)) => bytes,
            Some(Inbound::Closed(reason)) => {
                debug!("connection {id} closed: {reason}");
                break false;
            }
            None => break false,
        };
        buf.extend_from_slice(&bytes);

        loop {
            match codec::decode(&buf) {
                Ok((message, used)) => {
                    buf.advance(used);
                    match task.handle(message).await {
                        Flow::Continue => {}
                        Flow::Close { goodbye } => break 'conn goodbye,
                    }
                }
                Err(LoopError::NeedMoreData { .. }) => break,
                Err(e) => {
                    warn!("{:?} error on connection {id}: {e}", e.class());
                    break 'conn false;
                }
            }
        }
    };

    let _ = task.phase.begin_disconnect();
    task.link.close();
    if !goodbye {
        task.sessions.on_disconnect(id);
    }
    let _ = task.phase.finish_disconnect();
    debug!("connection {id} task finished");
}

impl LinkTask {
    async fn handle(&mut self, message: Message) -> Flow {
        match self.phase.session() {
            None => self.handshake(message).await,
            Some(session) => self.connected(session, message),
        }
    }

    async fn handshake(&mut self, message: Message) -> Flow {
        let Message::Hello(hello) = message else {
            warn!(
                "connection {} sent {} before Hello",
                self.link.id(),
                message.kind()
            );
            return Flow::Close { goodbye: false };
        };
        self.register(hello).await
    }

    async fn register(&mut self, hello: Hello) -> Flow {
        let record = ConnectionRecord::new(self.link.remote(), self.outbound.clone());
        let welcome = match self.sessions.register(record, &hello).await {
            Ok(welcome) => welcome,
            Err(e) => {
                warn!("connection {} refused: {e}", self.link.id());
                let _ = self.outbound.send_message(&Message::Shutdown {
                    reason: e.to_string(),
                });
                return Flow::Close { goodbye: false };
            }
        };
        let session = welcome.session_id;
        if let Err(e) = self.phase.complete_handshake(session) {
            warn!("connection {}: {e}", self.link.id());
            return Flow::Close { goodbye: false };
        }
        if let Err(e) = self.outbound.send_message(&Message::Welcome(welcome)) {
            warn!("welcome to connection {} failed: {e}", self.link.id());
            return Flow::Close { goodbye: false };
        }
        self.sessions.touch(self.link.id());
        Flow::Continue
    }

    fn connected(&mut self, session: SessionId, message: Message) -> Flow {
        let conn = self.link.id();
        if self.sessions.session_for(conn) != Some(session) {
            info!("connection {conn} lost session {session} to a newer connection");
            return Flow::Close { goodbye: false };
        }
        self.sessions.touch(conn);
        match message {
            Message::Command(frame) => {
                let id = frame.id;
                let rejection = match self
                    .sessions
                    .admit_from(conn, Command::from_frame(session, frame))
                {
                    Ok(Admission::Accepted) | Ok(Admission::Duplicate) => return Flow::Continue,
                    Ok(Admission::Stale) => {
                        ResponseFrame::rejected(id, Status::Stale, "command already applied")
                    }
                    Err(e) => {
                        let Some(status) = rejection_status(&e) else {
                            warn!("connection {conn}: {e}");
                            return Flow::Close { goodbye: false };
                        };
                        debug!("command {id} of session {session} rejected: {e}");
                        ResponseFrame::rejected(id, status, e)
                    }
                };
                self.reject(session, rejection)
            }
            Message::Ping { nonce } => {
                if let Err(e) = self.outbound.send_message(&Message::Pong { nonce }) {
                    debug!("pong to connection {conn} dropped: {e}");
                }
                Flow::Continue
            }
            Message::Pong { .. } => Flow::Continue,
            Message::Shutdown { reason } => {
                info!("session {session} said goodbye: {reason}");
                self.sessions.goodbye(conn);
                Flow::Close { goodbye: true }
            }
            Message::Hello(_) | Message::Welcome(_) | Message::Response(_) => {
                warn!(
                    "connection {conn} sent unexpected {}",
                    message.kind()
                );
                Flow::Close { goodbye: false }
            }
        }
    }

    fn reject(&self, session: SessionId, response: ResponseFrame) -> Flow {
        match self.sessions.reject(session, response) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!("closing connection {}: {e}", self.link.id());
                Flow::Close { goodbye: false }
            }
        }
    }
}

/// Status answering an admission error, or `None` if the error must
/// close the connection instead.
fn rejection_status(e: &LoopError) -> Option<Status> {
    match e {
        LoopError::ReplayConflict { .. } => Some(Status::ReplayConflict),
        LoopError::OutOfOrder { .. } => Some(Status::OutOfOrder),
        LoopError::QueueFull { .. } | LoopError::BacklogFull { .. } => Some(Status::QueueFull),
        LoopError::Draining => Some(Status::Draining),
        _ => None,
    }
}
