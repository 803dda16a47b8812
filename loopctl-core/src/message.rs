//! Protocol message types and their payloads.
//!
//! Unknown discriminants surface as errors through `TryFrom`.
//! Payload structs are serialized with `serde` + `bincode`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LoopError;

// ── MessageKind ──────────────────────────────────────────────────

/// Frame kind carried in the header.
///
/// - `0x0x`: handshake
/// - `0x1x`: command traffic
/// - `0x2x`: keepalive
/// - `0x3x`: lifecycle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client handshake (version, credentials, resume request).
    Hello = 0x01,
    /// Server handshake reply.
    Welcome = 0x02,
    /// A remote instruction.
    Command = 0x10,
    /// The outcome of one command.
    Response = 0x11,
    /// Keepalive probe.
    Ping = 0x20,
    /// Keepalive answer.
    Pong = 0x21,
    /// Graceful goodbye (client) or server going away (server).
    Shutdown = 0x30,
}

impl TryFrom<u8> for MessageKind {
    type Error = LoopError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageKind::Hello),
            0x02 => Ok(MessageKind::Welcome),
            0x10 => Ok(MessageKind::Command),
            0x11 => Ok(MessageKind::Response),
            0x20 => Ok(MessageKind::Ping),
            0x21 => Ok(MessageKind::Pong),
            0x30 => Ok(MessageKind::Shutdown),
            _ => Err(LoopError::UnknownVariant {
                type_name: "MessageKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── CommandKind ──────────────────────────────────────────────────

/// What a command asks the event loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Translate the payload into a native GUI event.
    InjectEvent,
    /// Read a value out of GUI state.
    QueryState,
    /// Drain and stop the event loop.
    Shutdown,
    /// Round-trip through the GUI thread.
    Ping,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Status ───────────────────────────────────────────────────────

/// Outcome carried by a [`ResponseFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// The handler failed; `result` holds the message.
    Failed,
    /// The id was already applied.
    Stale,
    /// The id is queued with different content.
    ReplayConflict,
    /// The id would reorder the session's stream.
    OutOfOrder,
    /// The command queue is full; resend later.
    QueueFull,
    /// The delegated job crashed or was cancelled.
    WorkerFailed,
    /// The event loop is shutting down.
    Draining,
    /// The session is not registered.
    Unknown,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Returns `true` when the command may succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Status::QueueFull)
    }
}

// ── Payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Free-form client name, for logs.
    pub client_name: String,
    /// Credentials checked by the server's authenticator.
    pub token: Option<String>,
    /// Session to reattach to after a reconnect.
    pub resume: Option<u64>,
    /// Advertised [`Capabilities`](crate::flags::Capabilities) bits.
    pub capabilities: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: u64,
    /// Highest command id already applied for this session.
    pub last_applied: u64,
    /// `true` when an existing session was reattached.
    pub resumed: bool,
    /// Negotiated capability bits.
    pub capabilities: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFrame {
    /// Client-assigned, strictly increasing per session.
    pub id: u64,
    pub kind: CommandKind,
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub command_id: u64,
    pub status: Status,
    /// Handler output on success, UTF-8 diagnostic otherwise.
    pub result: Vec<u8>,
}

impl ResponseFrame {
    pub fn ok(command_id: u64, result: Vec<u8>) -> Self {
        Self {
            command_id,
            status: Status::Ok,
            result,
        }
    }

    pub fn rejected(command_id: u64, status: Status, reason: impl fmt::Display) -> Self {
        Self {
            command_id,
            status,
            result: reason.to_string().into_bytes(),
        }
    }

    /// Diagnostic text of a non-`Ok` response.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.result).into_owned()
    }
}

// ── Message ──────────────────────────────────────────────────────

/// One decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    Command(CommandFrame),
    Response(ResponseFrame),
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Shutdown { reason: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Welcome(_) => MessageKind::Welcome,
            Message::Command(_) => MessageKind::Command,
            Message::Response(_) => MessageKind::Response,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::Shutdown { .. } => MessageKind::Shutdown,
        }
    }

    /// Serialize the kind-specific fields.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, LoopError> {
        let bytes = match self {
            Message::Hello(hello) => bincode::serialize(hello)?,
            Message::Welcome(welcome) => bincode::serialize(welcome)?,
            Message::Command(command) => bincode::serialize(command)?,
            Message::Response(response) => bincode::serialize(response)?,
            Message::Ping { nonce } | Message::Pong { nonce } => nonce.to_le_bytes().to_vec(),
            Message::Shutdown { reason } => reason.as_bytes().to_vec(),
        };
        Ok(bytes)
    }

    /// Inverse of [`payload_bytes`](Self::payload_bytes).
    pub fn from_payload(kind: MessageKind, payload: &[u8]) -> Result<Self, LoopError> {
        let message = match kind {
            MessageKind::Hello => Message::Hello(bincode::deserialize(payload)?),
            MessageKind::Welcome => Message::Welcome(bincode::deserialize(payload)?),
            MessageKind::Command => Message::Command(bincode::deserialize(payload)?),
            MessageKind::Response => Message::Response(bincode::deserialize(payload)?),
            MessageKind::Ping | MessageKind::Pong => {
                let nonce: [u8; 8] = payload
                    .try_into()
                    .map_err(|_| LoopError::MalformedFrame("keepalive payload must be 8 bytes"))?;
                let nonce = u64::from_le_bytes(nonce);
                if kind == MessageKind::Ping {
                    Message::Ping { nonce }
                } else {
                    Message::Pong { nonce }
                }
            }
            MessageKind::Shutdown => Message::Shutdown {
                reason: String::from_utf8(payload.to_vec())
                    .map_err(|e| LoopError::Encoding(e.to_string()))?,
            },
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_roundtrip() {
        let kinds = [
            MessageKind::Hello,
            MessageKind::Welcome,
            MessageKind::Command,
            MessageKind::Response,
            MessageKind::Ping,
            MessageKind::Pong,
            MessageKind::Shutdown,
        ];
        for kind in kinds {
            assert_eq!(MessageKind::try_from(kind as u8).unwrap(), kind);
        }
    }

    #[test]
    fn message_kind_invalid() {
        assert!(MessageKind::try_from(0xFF).is_err());
    }

    #[test]
    fn keepalive_payload_must_be_eight_bytes() {
        assert!(Message::from_payload(MessageKind::Ping, &[1, 2, 3]).is_err());
        assert_eq!(
            Message::from_payload(MessageKind::Pong, &7u64.to_le_bytes()).unwrap(),
            Message::Pong { nonce: 7 }
        );
    }

    #[test]
    fn rejected_response_carries_reason() {
        let resp = ResponseFrame::rejected(4, Status::Stale, "already applied");
        assert!(!resp.status.is_ok());
        assert_eq!(resp.reason(), "already applied");
    }

    #[test]
    fn only_queue_full_is_retryable() {
        assert!(Status::QueueFull.is_retryable());
        assert!(!Status::Stale.is_retryable());
        assert!(!Status::Failed.is_retryable());
    }
}
