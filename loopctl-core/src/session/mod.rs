//! Session registry: authentication, admission, reconnection.
//!
//! The [`SessionManager`] is the only writer of session state. Connection
//! tasks call [`register`](SessionManager::register) and
//! [`admit`](SessionManager::admit); the event loop bridge calls
//! [`begin_apply`](SessionManager::begin_apply),
//! [`mark_applied`](SessionManager::mark_applied) and
//! [`deliver`](SessionManager::deliver).
//!
//! Every admitted command is owed exactly one Response. A session never
//! owes more than `outbox_capacity` of them, counting those already
//! waiting in its outbox, so a Response is never discarded to make room.
//!
//! Lock order: the registry lock may be held while taking the queue lock,
//! never the reverse.

pub mod auth;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::{Command, ConnectionId, Fingerprint, SessionId};
use crate::error::LoopError;
use crate::flags::Capabilities;
use crate::header::PROTOCOL_VERSION;
use crate::message::{Hello, Message, ResponseFrame, Welcome};
use crate::network::Outbound;
use crate::queue::CommandQueue;

pub use auth::{AllowAll, Authenticator, SharedToken};

// ── Options ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long a detached session waits for its client to come back.
    pub grace_period: Duration,
    /// Unanswered commands per session, including Responses waiting to
    /// be written. Admission stops at this bound.
    pub outbox_capacity: usize,
    /// Evicted sessions remembered for stale-replay detection.
    pub retired_max: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            outbox_capacity: 256,
            retired_max: 4096,
        }
    }
}

// ── Admission ────────────────────────────────────────────────────

/// Result of offering a command to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Enqueued for application.
    Accepted,
    /// Same id and content already queued; nothing was added.
    Duplicate,
    /// The id was already applied.
    Stale,
}

// ── Records ──────────────────────────────────────────────────────

/// The live connection a session is attached to.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub version: u16,
    pub capabilities: Capabilities,
    pub last_seen: Instant,
    outbound: Outbound,
}

impl ConnectionRecord {
    pub fn new(remote: SocketAddr, outbound: Outbound) -> Self {
        Self {
            id: outbound.id(),
            remote,
            version: PROTOCOL_VERSION,
            capabilities: Capabilities::empty(),
            last_seen: Instant::now(),
            outbound,
        }
    }
}

#[derive(Debug)]
struct Session {
    connection: Option<ConnectionRecord>,
    last_applied: u64,
    highest_admitted: u64,
    /// Admitted but not yet applied, by command id.
    queued: BTreeMap<u64, Fingerprint>,
    /// Admitted and not yet answered, including offloaded work.
    owed: BTreeSet<u64>,
    outbox: VecDeque<ResponseFrame>,
    /// Bumped on every attach/detach; stale eviction timers compare it.
    generation: u64,
    detached_at: Option<Instant>,
}

impl Session {
    fn new(watermark: u64) -> Self {
        Self {
            connection: None,
            last_applied: watermark,
            highest_admitted: watermark,
            queued: BTreeMap::new(),
            owed: BTreeSet::new(),
            outbox: VecDeque::new(),
            generation: 0,
            detached_at: None,
        }
    }

    fn backlog(&self) -> usize {
        self.owed.len() + self.outbox.len()
    }

    /// Send stashed responses until the connection pushes back.
    fn flush(&mut self) {
        let Some(conn) = &self.connection else {
            return;
        };
        while let Some(response) = self.outbox.pop_front() {
            let message = Message::Response(response);
            if let Err(e) = conn.outbound.send_message(&message) {
                debug!("flush to connection {} paused: {e}", conn.id);
                if let Message::Response(response) = message {
                    self.outbox.push_front(response);
                }
                break;
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Session>,
    by_connection: HashMap<ConnectionId, SessionId>,
    retired: HashMap<SessionId, u64>,
    retired_order: VecDeque<SessionId>,
}

// ── SessionManager ───────────────────────────────────────────────

pub struct SessionManager {
    registry: Mutex<Registry>,
    queue: Arc<CommandQueue>,
    authenticator: Arc<dyn Authenticator>,
    options: SessionOptions,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(
        queue: Arc<CommandQueue>,
        authenticator: Arc<dyn Authenticator>,
        options: SessionOptions,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            queue,
            authenticator,
            options,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Authenticate `hello` and attach `conn` to a new or resumed session.
    ///
    /// Stashed responses stay stashed until the caller has sent the
    /// Welcome and calls [`touch`](Self::touch).
    pub async fn register(
        &self,
        mut conn: ConnectionRecord,
        hello: &Hello,
    ) -> Result<Welcome, LoopError> {
        self.authenticator
            .authenticate(conn.remote, hello)
            .await
            .map_err(LoopError::AuthRejected)?;

        conn.capabilities = Capabilities::local().negotiate(hello.capabilities);
        conn.last_seen = Instant::now();
        let capabilities = conn.capabilities.bits();
        let conn_id = conn.id;

        let mut reg = self.lock();

        let (session_id, resumed) = match hello.resume {
            Some(id) if reg.sessions.contains_key(&id) => (id, true),
            Some(id) if reg.retired.contains_key(&id) => {
                let watermark = reg.retired.remove(&id).unwrap_or_default();
                reg.retired_order.retain(|s| *s != id);
                reg.sessions.insert(id, Session::new(watermark));
                info!("session {id} recreated from tombstone at {watermark}");
                (id, false)
            }
            _ => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                reg.sessions.insert(id, Session::new(0));
                (id, false)
            }
        };

        let session = reg
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| LoopError::Corrupted(format!("session {session_id} vanished")))?;
        let displaced = session.connection.replace(conn);
        session.generation += 1;
        session.detached_at = None;
        let last_applied = session.last_applied;

        if let Some(old) = displaced {
            reg.by_connection.remove(&old.id);
            info!("session {session_id} taken over by connection {conn_id} from {}", old.id);
            let notice = Message::Shutdown {
                reason: format!("session {session_id} taken over by another connection"),
            };
            if let Err(e) = old.outbound.send_message(&notice) {
                debug!("takeover notice to connection {} dropped: {e}", old.id);
            }
            old.outbound.close();
        }
        reg.by_connection.insert(conn_id, session_id);

        info!(
            "connection {conn_id} ({}) bound to session {session_id}{}",
            hello.client_name,
            if resumed { " (resumed)" } else { "" }
        );

        Ok(Welcome {
            session_id,
            last_applied,
            resumed,
            capabilities,
        })
    }

    /// Detach the session bound to `conn` and start its grace timer.
    pub fn on_disconnect(self: &Arc<Self>, conn: ConnectionId) {
        let mut reg = self.lock();
        let Some(session_id) = reg.by_connection.remove(&conn) else {
            return;
        };
        let Some(session) = reg.sessions.get_mut(&session_id) else {
            return;
        };
        if session.connection.as_ref().map(|c| c.id) != Some(conn) {
            return;
        }

        let resumable = session
            .connection
            .take()
            .is_some_and(|c| c.capabilities.contains(Capabilities::RESUME));
        session.generation += 1;
        session.detached_at = Some(Instant::now());
        let generation = session.generation;

        if !resumable || self.options.grace_period.is_zero() {
            self.evict_locked(&mut reg, session_id);
            return;
        }
        drop(reg);

        debug!(
            "session {session_id} detached, grace {:?}",
            self.options.grace_period
        );
        let this = Arc::clone(self);
        let grace = self.options.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.evict_if_detached(session_id, generation);
        });
    }

    /// Client said goodbye: evict without waiting.
    pub fn goodbye(&self, conn: ConnectionId) {
        let mut reg = self.lock();
        if let Some(session_id) = reg.by_connection.remove(&conn) {
            self.evict_locked(&mut reg, session_id);
        }
    }

    fn evict_if_detached(&self, session_id: SessionId, generation: u64) {
        let mut reg = self.lock();
        let expired = reg
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.connection.is_none() && s.generation == generation);
        if expired {
            self.evict_locked(&mut reg, session_id);
        }
    }

    /// Remove a session immediately.
    pub fn evict(&self, session_id: SessionId) {
        let mut reg = self.lock();
        self.evict_locked(&mut reg, session_id);
    }

    fn evict_locked(&self, reg: &mut Registry, session_id: SessionId) {
        let Some(session) = reg.sessions.remove(&session_id) else {
            return;
        };
        if let Some(conn) = &session.connection {
            reg.by_connection.remove(&conn.id);
        }
        let dropped = self.queue.purge(session_id);
        if !dropped.is_empty() {
            warn!(
                "session {session_id} evicted with {} unapplied commands",
                dropped.len()
            );
        }

        reg.retired.insert(session_id, session.last_applied);
        reg.retired_order.push_back(session_id);
        while reg.retired_order.len() > self.options.retired_max {
            if let Some(oldest) = reg.retired_order.pop_front() {
                reg.retired.remove(&oldest);
            }
        }
        info!(
            "session {session_id} evicted at command {}",
            session.last_applied
        );
    }

    // ── Admission ────────────────────────────────────────────────

    /// Enforce strictly increasing ids and enqueue `command`.
    pub fn admit(&self, session_id: SessionId, command: Command) -> Result<Admission, LoopError> {
        let mut reg = self.lock();
        self.admit_locked(&mut reg, session_id, command)
    }

    /// Like [`admit`](Self::admit), but only while `conn` still owns the
    /// command's session.
    pub fn admit_from(&self, conn: ConnectionId, command: Command) -> Result<Admission, LoopError> {
        let mut reg = self.lock();
        let session_id = command.session();
        if reg.by_connection.get(&conn) != Some(&session_id) {
            return Err(LoopError::Displaced(conn));
        }
        self.admit_locked(&mut reg, session_id, command)
    }

    fn admit_locked(
        &self,
        reg: &mut Registry,
        session_id: SessionId,
        command: Command,
    ) -> Result<Admission, LoopError> {
        let session = reg
            .sessions
            .get_mut(&session_id)
            .ok_or(LoopError::UnknownSession(session_id))?;

        let id = command.id();
        if id <= session.last_applied {
            return Ok(Admission::Stale);
        }
        if let Some(existing) = session.queued.get(&id) {
            return if *existing == command.fingerprint() {
                Ok(Admission::Duplicate)
            } else {
                Err(LoopError::ReplayConflict { id })
            };
        }
        if id <= session.highest_admitted {
            return Err(LoopError::OutOfOrder {
                id,
                highest: session.highest_admitted,
            });
        }

        if session.backlog() >= self.options.outbox_capacity {
            return Err(LoopError::BacklogFull {
                session: session_id,
                capacity: self.options.outbox_capacity,
            });
        }

        let fingerprint = command.fingerprint();
        self.queue.enqueue(command)?;
        session.queued.insert(id, fingerprint);
        session.owed.insert(id);
        session.highest_admitted = id;
        Ok(Admission::Accepted)
    }

    /// Record activity on `conn` and push out any stashed responses.
    pub fn touch(&self, conn: ConnectionId) {
        let mut reg = self.lock();
        let Some(session_id) = reg.by_connection.get(&conn).copied() else {
            return;
        };
        if let Some(session) = reg.sessions.get_mut(&session_id) {
            if let Some(record) = session.connection.as_mut() {
                record.last_seen = Instant::now();
            }
            session.flush();
        }
    }

    /// Retry stashed responses on `conn`, e.g. once its write buffer drains.
    pub fn flush(&self, conn: ConnectionId) {
        let mut reg = self.lock();
        let Some(session_id) = reg.by_connection.get(&conn).copied() else {
            return;
        };
        if let Some(session) = reg.sessions.get_mut(&session_id) {
            session.flush();
        }
    }

    // ── Application (event loop side) ────────────────────────────

    /// Returns `true` if `command` is still owed an application.
    pub fn begin_apply(&self, command: &Command) -> bool {
        self.lock()
            .sessions
            .get(&command.session())
            .is_some_and(|s| command.id() > s.last_applied && s.queued.contains_key(&command.id()))
    }

    /// Record that `command_id` has been applied.
    pub fn mark_applied(&self, session_id: SessionId, command_id: u64) -> Result<(), LoopError> {
        let mut reg = self.lock();
        let Some(session) = reg.sessions.get_mut(&session_id) else {
            return Ok(());
        };
        if command_id <= session.last_applied {
            return Err(LoopError::Corrupted(format!(
                "session {session_id} applied {command_id} after {}",
                session.last_applied
            )));
        }
        session.queued.remove(&command_id);
        session.last_applied = command_id;
        Ok(())
    }

    /// Route the Response owed for an admitted command to whatever
    /// connection the session has now.
    pub fn deliver(&self, session_id: SessionId, response: ResponseFrame) {
        let mut reg = self.lock();
        let Some(session) = reg.sessions.get_mut(&session_id) else {
            debug!(
                "dropping response to command {} of evicted session {session_id}",
                response.command_id
            );
            return;
        };
        if !session.owed.remove(&response.command_id) {
            warn!(
                "session {session_id} answered command {} it did not owe",
                response.command_id
            );
        }
        session.outbox.push_back(response);
        session.flush();
    }

    /// Answer a command refused at admission.
    ///
    /// Rejections share the outbox bound with owed Responses. Past it the
    /// client is not reading, and the caller should close the connection.
    pub fn reject(&self, session_id: SessionId, response: ResponseFrame) -> Result<(), LoopError> {
        let mut reg = self.lock();
        let Some(session) = reg.sessions.get_mut(&session_id) else {
            return Err(LoopError::UnknownSession(session_id));
        };
        if session.outbox.len() >= self.options.outbox_capacity {
            let conn = session.connection.as_ref().map_or(0, |c| c.id);
            return Err(LoopError::BackpressureExceeded(conn));
        }
        session.outbox.push_back(response);
        session.flush();
        Ok(())
    }

    /// Send `message` to every attached connection.
    pub fn broadcast(&self, message: &Message) {
        let reg = self.lock();
        for session in reg.sessions.values() {
            if let Some(conn) = &session.connection {
                if let Err(e) = conn.outbound.send_message(message) {
                    debug!("broadcast to connection {} failed: {e}", conn.id);
                }
            }
        }
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn session_for(&self, conn: ConnectionId) -> Option<SessionId> {
        self.lock().by_connection.get(&conn).copied()
    }

    pub fn last_applied(&self, session_id: SessionId) -> Option<u64> {
        self.lock().sessions.get(&session_id).map(|s| s.last_applied)
    }

    pub fn is_attached(&self, session_id: SessionId) -> bool {
        self.lock()
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.connection.is_some())
    }

    /// Admitted commands still waiting for their Response.
    pub fn unanswered(&self, session_id: SessionId) -> usize {
        self.lock()
            .sessions
            .get(&session_id)
            .map_or(0, |s| s.owed.len())
    }

    /// Responses waiting for a reachable connection.
    pub fn undelivered(&self, session_id: SessionId) -> usize {
        self.lock()
            .sessions
            .get(&session_id)
            .map_or(0, |s| s.outbox.len())
    }

    /// How long the session has been without a connection.
    pub fn detached_for(&self, session_id: SessionId) -> Option<Duration> {
        self.lock()
            .sessions
            .get(&session_id)
            .and_then(|s| s.detached_at)
            .map(|t| t.elapsed())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.lock();
        f.debug_struct("SessionManager")
            .field("sessions", &reg.sessions.len())
            .field("connections", &reg.by_connection.len())
            .field("retired", &reg.retired.len())
            .finish()
    }
}
