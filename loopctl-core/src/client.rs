//! Control client: the remote side of the protocol.
//!
//! ```no_run
//! # async fn demo() -> Result<(), loopctl_core::LoopError> {
//! use loopctl_core::client::{ClientOptions, ControlClient};
//!
//! let info = "127.0.0.1:7300".parse()?;
//! let client = ControlClient::connect(info, ClientOptions::new("demo")).await?;
//! let response = client.ping().await?;
//! assert!(response.status.is_ok());
//! client.goodbye().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::ApiCall;
use crate::error::{HostError, LoopError};
use crate::flags::Capabilities;
use crate::message::{CommandFrame, CommandKind, Hello, Message, ResponseFrame, Status, Welcome};
use crate::network::{Connection, ConnectionInfo};
use crate::state::{ConnectionPhase, PendingCommands};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub name: String,
    pub token: Option<String>,
    pub capabilities: Capabilities,
    pub handshake_timeout: Duration,
    /// Per-command deadline; `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: None,
            capabilities: Capabilities::local(),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// State shared with the background reader.
#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<PendingCommands>,
    phase: Mutex<ConnectionPhase>,
    server_shutdown: Mutex<Option<String>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingCommands> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn phase(&self) -> MutexGuard<'_, ConnectionPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct ControlClient {
    info: ConnectionInfo,
    options: ClientOptions,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    welcome: Welcome,
    next_id: AtomicU64,
}

impl ControlClient {
    /// Connect, handshake and start a new session.
    pub async fn connect(info: ConnectionInfo, options: ClientOptions) -> Result<Self, LoopError> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingCommands::new()),
            ..Default::default()
        });
        let (tx, reader, welcome) = Self::open(&info, &options, &shared, None).await?;
        Ok(Self {
            next_id: AtomicU64::new(welcome.last_applied + 1),
            info,
            options,
            shared,
            tx,
            reader,
            welcome,
        })
    }

    async fn open(
        info: &ConnectionInfo,
        options: &ClientOptions,
        shared: &Arc<Shared>,
        resume: Option<u64>,
    ) -> Result<(mpsc::Sender<Message>, JoinHandle<()>, Welcome), LoopError> {
        shared.phase().force_disconnect();
        shared.phase().begin_connect()?;
        let mut conn = match Connection::connect(info).await {
            Ok(conn) => conn,
            Err(e) => {
                shared.phase().force_disconnect();
                return Err(e);
            }
        };
        shared.phase().begin_handshake()?;

        let hello = Hello {
            client_name: options.name.clone(),
            token: options.token.clone(),
            resume,
            capabilities: options.capabilities.bits(),
        };
        let welcome = match tokio::time::timeout(
            options.handshake_timeout,
            Self::handshake(&mut conn, hello),
        )
        .await
        {
            Ok(Ok(welcome)) => welcome,
            Ok(Err(e)) => {
                shared.phase().force_disconnect();
                return Err(e);
            }
            Err(_) => {
                shared.phase().force_disconnect();
                return Err(LoopError::Timeout(options.handshake_timeout));
            }
        };
        shared.phase().complete_handshake(welcome.session_id)?;
        info!(
            "connected to {info} as session {} (last applied {})",
            welcome.session_id, welcome.last_applied
        );

        let (tx, rx) = conn.into_parts();
        let reader = tokio::spawn(read_loop(rx, tx.clone(), Arc::clone(shared), welcome.session_id));
        Ok((tx, reader, welcome))
    }

    async fn handshake(conn: &mut Connection, hello: Hello) -> Result<Welcome, LoopError> {
        conn.send(Message::Hello(hello)).await?;
        loop {
            match conn.recv().await {
                Some(Message::Welcome(welcome)) => return Ok(welcome),
                Some(Message::Ping { nonce }) => conn.send(Message::Pong { nonce }).await?,
                Some(Message::Shutdown { reason }) => return Err(LoopError::AuthRejected(reason)),
                Some(other) => {
                    debug!("ignoring {} before Welcome", other.kind());
                }
                None => return Err(LoopError::ConnectionClosed(0)),
            }
        }
    }

    /// Re-establish the connection and resume the session.
    ///
    /// Commands sent but not yet applied are sent again; answers for
    /// commands applied while detached are flushed by the server.
    pub async fn reconnect(&mut self) -> Result<Welcome, LoopError> {
        self.reader.abort();
        let resume = Some(self.welcome.session_id);
        let (tx, reader, welcome) = Self::open(&self.info, &self.options, &self.shared, resume).await?;
        self.tx = tx;
        self.reader = reader;
        self.next_id
            .fetch_max(welcome.last_applied + 1, Ordering::SeqCst);

        let resend = self.shared.pending().unapplied_after(welcome.last_applied);
        if !resend.is_empty() {
            info!("resending {} unapplied commands", resend.len());
        }
        for frame in resend {
            self.tx.send(Message::Command(frame)).await?;
        }
        self.welcome = welcome.clone();
        Ok(welcome)
    }

    pub fn session_id(&self) -> u64 {
        self.welcome.session_id
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.phase().clone()
    }

    /// Reason given by the server if it announced a shutdown.
    pub fn server_shutdown(&self) -> Option<String> {
        self.shared
            .server_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pending(&self) -> usize {
        self.shared.pending().len()
    }

    /// Id the next command will use.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Send a command under the next id and wait for its Response.
    pub async fn call(&self, kind: CommandKind, args: Vec<u8>) -> Result<ResponseFrame, LoopError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.send_with_id(id, kind, args).await
    }

    /// Send a command under an explicit id, e.g. to replay one.
    ///
    /// A rejection that arrives for an id already being awaited (a
    /// replayed duplicate) resolves that waiter.
    pub async fn send_with_id(
        &self,
        id: u64,
        kind: CommandKind,
        args: Vec<u8>,
    ) -> Result<ResponseFrame, LoopError> {
        let frame = CommandFrame { id, kind, args };
        let rx = self.shared.pending().track(frame.clone());
        self.tx.send(Message::Command(frame)).await?;
        let outcome = match self.options.request_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.shared.pending().expire(id);
                    return Err(LoopError::Timeout(deadline));
                }
            },
            None => rx.await,
        };
        outcome.map_err(|_| LoopError::ChannelClosed)?
    }

    pub async fn ping(&self) -> Result<ResponseFrame, LoopError> {
        self.call(CommandKind::Ping, Vec::new()).await
    }

    pub async fn inject(&self, payload: Vec<u8>) -> Result<ResponseFrame, LoopError> {
        self.call(CommandKind::InjectEvent, payload).await
    }

    pub async fn query(&self, selector: Vec<u8>) -> Result<ResponseFrame, LoopError> {
        self.call(CommandKind::QueryState, selector).await
    }

    /// Ask the host to drain and stop its event loop.
    pub async fn shutdown_host(&self) -> Result<ResponseFrame, LoopError> {
        self.call(CommandKind::Shutdown, Vec::new()).await
    }

    /// Invoke a named host method and decode its JSON result.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value, LoopError> {
        let payload = ApiCall::new(method, args).to_bytes()?;
        let response = self.inject(payload).await?;
        match response.status {
            Status::Ok => serde_json::from_slice(&response.result)
                .map_err(|e| LoopError::from(HostError::from(e))),
            Status::WorkerFailed => Err(LoopError::Application(response.reason())),
            _ => Err(LoopError::Application(format!(
                "{:?}: {}",
                response.status,
                response.reason()
            ))),
        }
    }

    /// Say goodbye; the server evicts the session right away.
    pub async fn goodbye(self) -> Result<(), LoopError> {
        self.shared.phase().begin_disconnect()?;
        self.tx
            .send(Message::Shutdown {
                reason: format!("{} closing", self.options.name),
            })
            .await?;
        drop(self.tx);
        // The reader ends once the server closes its side.
        let _ = tokio::time::timeout(self.options.handshake_timeout, self.reader).await;
        self.shared.phase().force_disconnect();
        Ok(())
    }
}

async fn read_loop(
    mut rx: mpsc::Receiver<Message>,
    tx: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    session: u64,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Response(response) => {
                let id = response.command_id;
                if !shared.pending().resolve(response) {
                    debug!("unsolicited response for command {id}");
                }
            }
            Message::Ping { nonce } => {
                if tx.send(Message::Pong { nonce }).await.is_err() {
                    break;
                }
            }
            Message::Shutdown { reason } => {
                warn!("server shutting down: {reason}");
                *shared
                    .server_shutdown
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(reason);
            }
            other => debug!("ignoring {} from server", other.kind()),
        }
    }

    shared.phase().force_disconnect();
    let outstanding = shared.pending().len();
    if shared
        .server_shutdown
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
    {
        shared.pending().fail_all(session);
    } else if outstanding > 0 {
        // Kept for `reconnect`, which resends what was not applied.
        warn!("connection lost with {outstanding} commands outstanding");
    }
}
