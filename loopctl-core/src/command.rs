//! The unit of remote instruction held by the command queue.

use std::time::Instant;

use crate::message::{CommandFrame, CommandKind};

/// Server-assigned session identifier.
pub type SessionId = u64;

/// Transport-assigned connection identifier.
pub type ConnectionId = u64;

/// Content identity used to tell an idempotent re-send from a conflict.
pub type Fingerprint = blake3::Hash;

/// A command admitted for one session. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct Command {
    session: SessionId,
    id: u64,
    kind: CommandKind,
    payload: Vec<u8>,
    arrived_at: Instant,
}

impl Command {
    pub fn new(session: SessionId, id: u64, kind: CommandKind, payload: Vec<u8>) -> Self {
        Self {
            session,
            id,
            kind,
            payload,
            arrived_at: Instant::now(),
        }
    }

    pub fn from_frame(session: SessionId, frame: CommandFrame) -> Self {
        Self::new(session, frame.id, frame.kind, frame.args)
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    /// Hash over `(kind, payload)`; ids and timestamps are excluded.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[kind_tag(self.kind)]);
        hasher.update(&self.payload);
        hasher.finalize()
    }
}

fn kind_tag(kind: CommandKind) -> u8 {
    match kind {
        CommandKind::InjectEvent => 1,
        CommandKind::QueryState => 2,
        CommandKind::Shutdown => 3,
        CommandKind::Ping => 4,
    }
}
