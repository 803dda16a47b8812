//! The event loop bridge: the only code that touches the host GUI.
//!
//! An [`EventLoopBridge`] is created on the GUI thread and driven by it,
//! one [`tick`](EventLoopBridge::tick) per event loop iteration. Each tick
//! delivers finished worker results and then applies at most one queued
//! command.
//!
//! ```text
//!  Idle ──(dequeue)──► Applying ──(handler done / failed)──► Idle
//!    │                     │
//!    └───(Shutdown)────────┴──► Draining ──(workers done)──► Stopped
//! ```

pub mod api;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::command::{Command, SessionId};
use crate::dispatch::{Completion, Job, TaskKey, WorkerPool, panic_message};
use crate::error::{HostError, LoopError, WorkerError};
use crate::message::{CommandKind, Message, ResponseFrame, Status};
use crate::queue::CommandQueue;
use crate::session::SessionManager;

pub use api::{ApiCall, ApiRegistry};

// ── Host contract ────────────────────────────────────────────────

/// What a handler produced.
pub enum Reply {
    /// Finished on the GUI thread.
    Ready(Vec<u8>),
    /// Continue on the worker pool; the Response is sent when it ends.
    Offload(Job),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Ready(bytes) => f.debug_tuple("Ready").field(&bytes.len()).finish(),
            Reply::Offload(_) => f.write_str("Offload"),
        }
    }
}

/// The host framework's thread-affine API. Every method is called on
/// the GUI thread, from inside [`EventLoopBridge::tick`].
pub trait HostGui {
    fn inject_event(&mut self, payload: &[u8]) -> Result<Reply, HostError>;

    fn query_state(&mut self, selector: &[u8]) -> Result<Reply, HostError>;

    /// A delegated job finished successfully.
    fn worker_result(&mut self, _key: TaskKey, _result: &[u8]) {}
}

// ── State ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Applying { session: SessionId, command_id: u64 },
    Draining { since: Instant },
    Stopped,
}

impl BridgeState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tick {
    pub seq: u64,
    /// `(session, command id)` of the command applied this tick.
    pub applied: Option<(SessionId, u64)>,
    /// Worker results delivered this tick.
    pub completed: usize,
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub tick_budget: Duration,
    pub drain_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            tick_budget: Duration::from_millis(16),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Asks a running bridge to drain and stop from outside the GUI thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── EventLoopBridge ──────────────────────────────────────────────

pub struct EventLoopBridge<H> {
    host: H,
    queue: Arc<CommandQueue>,
    sessions: Arc<SessionManager>,
    workers: WorkerPool,
    options: BridgeOptions,
    state: BridgeState,
    seq: u64,
    signal: ShutdownSignal,
}

impl<H: HostGui> EventLoopBridge<H> {
    pub fn new(
        host: H,
        sessions: Arc<SessionManager>,
        workers: WorkerPool,
        options: BridgeOptions,
    ) -> Self {
        Self {
            host,
            queue: Arc::clone(sessions.queue()),
            sessions,
            workers,
            options,
            state: BridgeState::Idle,
            seq: 0,
            signal: ShutdownSignal::default(),
        }
    }

    /// Convenience constructor spawning workers on `runtime`.
    pub fn with_pool(
        host: H,
        sessions: Arc<SessionManager>,
        pool_size: usize,
        runtime: Handle,
        options: BridgeOptions,
    ) -> Self {
        Self::new(host, sessions, WorkerPool::new(pool_size, runtime), options)
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Commands waiting plus jobs still running.
    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || !self.workers.is_idle()
    }

    /// Run one event loop iteration's worth of control work.
    ///
    /// Returns `Err` only for session state corruption, after which the
    /// bridge is stopped.
    pub fn tick(&mut self) -> Result<Tick, LoopError> {
        if self.state.is_stopped() {
            return Ok(Tick {
                seq: self.seq,
                ..Default::default()
            });
        }
        self.seq += 1;
        let started = Instant::now();
        let mut tick = Tick {
            seq: self.seq,
            ..Default::default()
        };

        if self.signal.is_triggered() && matches!(self.state, BridgeState::Idle) {
            self.begin_drain("host shutting down");
        }

        tick.completed = self.deliver_completions(started);

        if let BridgeState::Draining { since } = self.state {
            self.continue_drain(since);
            return Ok(tick);
        }

        let Some(command) = self.queue.dequeue_next() else {
            return Ok(tick);
        };
        if !self.sessions.begin_apply(&command) {
            debug!(
                "skipping command {} of session {}: no longer owed",
                command.id(),
                command.session()
            );
            return Ok(tick);
        }

        tick.applied = Some((command.session(), command.id()));
        if let Err(e) = self.apply(command) {
            error!("session state corrupted: {e}");
            self.stop();
            return Err(e);
        }

        let elapsed = started.elapsed();
        if elapsed > self.options.tick_budget {
            warn!(
                "tick {} took {elapsed:?}, over budget {:?}",
                self.seq, self.options.tick_budget
            );
        }
        Ok(tick)
    }

    fn apply(&mut self, command: Command) -> Result<(), LoopError> {
        let session = command.session();
        let id = command.id();
        self.state = BridgeState::Applying {
            session,
            command_id: id,
        };
        debug!(
            "applying {} {id} of session {session} after {:?} queued",
            command.kind(),
            command.arrived_at().elapsed()
        );

        let outcome = match command.kind() {
            CommandKind::Ping => Ok(Ok(Reply::Ready(self.seq.to_le_bytes().to_vec()))),
            CommandKind::Shutdown => Ok(Ok(Reply::Ready(Vec::new()))),
            CommandKind::InjectEvent => {
                let host = &mut self.host;
                catch_unwind(AssertUnwindSafe(|| host.inject_event(command.payload())))
            }
            CommandKind::QueryState => {
                let host = &mut self.host;
                catch_unwind(AssertUnwindSafe(|| host.query_state(command.payload())))
            }
        };

        self.sessions.mark_applied(session, id)?;
        self.state = BridgeState::Idle;

        match outcome {
            Ok(Ok(Reply::Ready(result))) => {
                self.sessions.deliver(session, ResponseFrame::ok(id, result));
            }
            Ok(Ok(Reply::Offload(job))) => {
                self.workers.submit(
                    TaskKey {
                        session,
                        command_id: id,
                    },
                    job,
                );
            }
            Ok(Err(e)) => {
                debug!("command {id} of session {session} failed: {e}");
                self.sessions
                    .deliver(session, ResponseFrame::rejected(id, Status::Failed, e));
            }
            Err(payload) => {
                let message = panic_message(payload);
                warn!("handler panicked on command {id} of session {session}: {message}");
                self.sessions.deliver(
                    session,
                    ResponseFrame::rejected(id, Status::Failed, format!("handler panicked: {message}")),
                );
            }
        }

        if command.kind() == CommandKind::Shutdown {
            info!("shutdown requested by session {session}");
            self.begin_drain("shutdown requested by client");
        }
        Ok(())
    }

    fn deliver_completions(&mut self, started: Instant) -> usize {
        let mut delivered = 0;
        loop {
            if delivered > 0 && started.elapsed() >= self.options.tick_budget {
                break;
            }
            let Some(completion) = self.workers.poll_completions(1).pop() else {
                break;
            };
            self.deliver_completion(completion);
            delivered += 1;
        }
        delivered
    }

    fn deliver_completion(&mut self, Completion { key, result }: Completion) {
        let response = match result {
            Ok(bytes) => {
                let host = &mut self.host;
                if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| host.worker_result(key, &bytes)))
                {
                    warn!("worker result hook panicked for {key}: {}", panic_message(payload));
                }
                ResponseFrame::ok(key.command_id, bytes)
            }
            Err(e) => {
                warn!("worker job {key} failed: {e}");
                ResponseFrame::rejected(key.command_id, Status::WorkerFailed, e)
            }
        };
        self.sessions.deliver(key.session, response);
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Stop admitting, refuse what is queued, and tell every client.
    fn begin_drain(&mut self, reason: &str) {
        if matches!(self.state, BridgeState::Draining { .. } | BridgeState::Stopped) {
            return;
        }
        info!("event loop draining: {reason}");
        self.state = BridgeState::Draining {
            since: Instant::now(),
        };
        for command in self.queue.close() {
            self.sessions.deliver(
                command.session(),
                ResponseFrame::rejected(command.id(), Status::Draining, "event loop is shutting down"),
            );
        }
        self.sessions.broadcast(&Message::Shutdown {
            reason: reason.to_string(),
        });
    }

    fn continue_drain(&mut self, since: Instant) {
        if self.workers.is_idle() {
            self.stop();
            return;
        }
        if since.elapsed() < self.options.drain_timeout {
            return;
        }
        let cancelled = self.workers.cancel_all();
        warn!(
            "drain timeout after {:?}, cancelling {} jobs",
            self.options.drain_timeout,
            cancelled.len()
        );
        for key in cancelled {
            self.sessions.deliver(
                key.session,
                ResponseFrame::rejected(key.command_id, Status::WorkerFailed, WorkerError::Cancelled),
            );
        }
        self.stop();
    }

    fn stop(&mut self) {
        self.queue.close();
        self.state = BridgeState::Stopped;
        info!("event loop bridge stopped after {} ticks", self.seq);
    }
}

impl<H> std::fmt::Debug for EventLoopBridge<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopBridge")
            .field("state", &self.state)
            .field("seq", &self.seq)
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .finish()
    }
}
