//! Domain-specific error types for the loopctl protocol.
//!
//! All fallible operations return `Result<T, LoopError>`. Every variant
//! maps onto an [`ErrorClass`] that decides how far a failure is allowed
//! to travel: a protocol error closes one connection, a session error
//! rejects one command, an application error becomes one Response.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the loopctl protocol.
#[derive(Debug, Error)]
pub enum LoopError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// Frame length or checksum did not match the payload.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The header carries a protocol version this build cannot speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// The buffer holds only part of a frame.
    #[error("need {needed} more bytes to complete the frame")]
    NeedMoreData { needed: usize },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A frame arrived that is not legal in the current connection phase.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer went away or the connection was closed locally.
    #[error("connection {0} closed")]
    ConnectionClosed(u64),

    /// The bounded write buffer of a connection is full.
    #[error("write buffer of connection {0} is full")]
    BackpressureExceeded(u64),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Session Errors ───────────────────────────────────────────
    /// The authenticator declined the connection.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// A queued command id was re-sent with different content.
    #[error("command {id} replayed with different content")]
    ReplayConflict { id: u64 },

    /// A command id would reorder the session's command stream.
    #[error("command {id} arrived after {highest}")]
    OutOfOrder { id: u64, highest: u64 },

    /// The session id is not registered.
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// The connection's session was taken over by a newer connection.
    #[error("connection {0} no longer owns its session")]
    Displaced(u64),

    // ── Backpressure ─────────────────────────────────────────────
    /// The command queue is at capacity.
    #[error("command queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The session has as many unanswered commands as it can buffer
    /// Responses for.
    #[error("session {session} has {capacity} unanswered commands")]
    BacklogFull { session: u64, capacity: usize },

    /// The event loop is shutting down and admits nothing new.
    #[error("event loop is draining")]
    Draining,

    // ── Application / Worker Errors ──────────────────────────────
    /// A command handler failed on the GUI thread.
    #[error("application error: {0}")]
    Application(String),

    /// A delegated job failed.
    #[error("worker failed: {0}")]
    WorkerFailed(#[from] WorkerError),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Fatal ────────────────────────────────────────────────────
    /// Session bookkeeping is inconsistent with the queue.
    #[error("session state corrupted: {0}")]
    Corrupted(String),
}

/// How far an error is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Isolated to one connection.
    Transport,
    /// Closes the offending connection.
    Protocol,
    /// Rejects one command, connection stays open.
    Session,
    /// Reported in the command's Response.
    Application,
    /// Reported in the command's Response.
    Worker,
    /// Surfaced to the transport, which rejects the command.
    Backpressure,
    /// Not recoverable.
    Fatal,
}

impl LoopError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedFrame(_)
            | Self::UnsupportedVersion(_)
            | Self::NeedMoreData { .. }
            | Self::UnknownVariant { .. }
            | Self::PayloadTooLarge { .. }
            | Self::ProtocolViolation(_)
            | Self::Encoding(_) => ErrorClass::Protocol,
            Self::Connection(_)
            | Self::ConnectionClosed(_)
            | Self::BackpressureExceeded(_)
            | Self::ChannelClosed
            | Self::Timeout(_) => ErrorClass::Transport,
            Self::AuthRejected(_)
            | Self::ReplayConflict { .. }
            | Self::OutOfOrder { .. }
            | Self::UnknownSession(_)
            | Self::Displaced(_) => ErrorClass::Session,
            Self::QueueFull { .. } | Self::BacklogFull { .. } | Self::Draining => {
                ErrorClass::Backpressure
            }
            Self::Application(_) => ErrorClass::Application,
            Self::WorkerFailed(_) => ErrorClass::Worker,
            Self::Corrupted(_) => ErrorClass::Fatal,
        }
    }

    /// Returns `true` if the connection that produced this error must be closed.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Protocol | ErrorClass::Transport | ErrorClass::Fatal
        ) || matches!(self, Self::AuthRejected(_) | Self::Displaced(_))
    }
}

// ── WorkerError ───────────────────────────────────────────────────

/// Typed error for jobs delegated to the worker pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The job panicked; the panic did not escape the worker.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job was cancelled before it produced a result.
    #[error("job was cancelled")]
    Cancelled,

    /// The job returned an error.
    #[error("job failed: {0}")]
    Failed(String),
}

// ── HostError ─────────────────────────────────────────────────────

/// Failure reported by the host GUI framework.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    /// The payload could not be interpreted.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No handler is registered for the named call.
    #[error("no handler registered for '{0}'")]
    UnknownMethod(String),

    /// The host rejected the action.
    #[error("{0}")]
    Rejected(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<HostError> for LoopError {
    fn from(e: HostError) -> Self {
        LoopError::Application(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LoopError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LoopError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for LoopError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        LoopError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        HostError::InvalidPayload(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = LoopError::UnsupportedVersion(7);
        assert!(e.to_string().contains('7'));

        let e = LoopError::PayloadTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            LoopError::MalformedFrame("checksum").class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            LoopError::ReplayConflict { id: 3 }.class(),
            ErrorClass::Session
        );
        assert_eq!(
            LoopError::QueueFull { capacity: 10 }.class(),
            ErrorClass::Backpressure
        );
        assert_eq!(
            LoopError::from(WorkerError::Cancelled).class(),
            ErrorClass::Worker
        );
    }

    #[test]
    fn session_errors_keep_connection_open() {
        assert!(!LoopError::ReplayConflict { id: 1 }.closes_connection());
        assert!(!LoopError::QueueFull { capacity: 1 }.closes_connection());
        assert!(LoopError::UnsupportedVersion(9).closes_connection());
        assert!(LoopError::AuthRejected("nope".into()).closes_connection());
        assert!(LoopError::Displaced(4).closes_connection());
        assert!(
            !LoopError::BacklogFull {
                session: 1,
                capacity: 8
            }
            .closes_connection()
        );
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: LoopError = io_err.into();
        assert!(matches!(e, LoopError::Connection(_)));
    }

    #[test]
    fn host_error_becomes_application_error() {
        let e: LoopError = HostError::UnknownMethod("fly".into()).into();
        assert!(matches!(e, LoopError::Application(ref m) if m.contains("fly")));
    }
}
