//! Connection lifecycle shared by the control client and the server's
//! per-connection tasks.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::command::SessionId;
use crate::error::LoopError;

/// The current phase of one control connection.
///
/// ```text
///  Disconnected ──► Connecting ──► Handshaking ──► Connected
///       ▲                │               │              │
///       │                ▼               ▼              ▼
///       └──────── Disconnecting ◄────────┴──────────────┘
/// ```
///
/// Server-side links start in `Handshaking` (see [`accepted`](Self::accepted)).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,

    /// TCP connect in progress.
    Connecting,

    /// Link is up; waiting for Hello / Welcome.
    Handshaking,

    /// Bound to a session; commands may flow.
    Connected { session: SessionId, since: Instant },

    /// Goodbye sent or received; flushing before close.
    Disconnecting,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Connected { session, .. } => write!(f, "Connected(session {session})"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl ConnectionPhase {
    /// Phase of a freshly accepted server-side link.
    pub fn accepted() -> Self {
        Self::Handshaking
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Session this connection is bound to, once connected.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Connected { session, .. } => Some(*session),
            _ => None,
        }
    }

    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), LoopError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(LoopError::ProtocolViolation(
                "cannot connect: not in Disconnected state",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn begin_handshake(&mut self) -> Result<(), LoopError> {
        match self {
            Self::Connecting => {
                *self = Self::Handshaking;
                Ok(())
            }
            _ => Err(LoopError::ProtocolViolation(
                "cannot handshake: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Handshaking`. A second Hello on a connected link is
    /// rejected here.
    pub fn complete_handshake(&mut self, session: SessionId) -> Result<(), LoopError> {
        match self {
            Self::Handshaking => {
                *self = Self::Connected {
                    session,
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(LoopError::ProtocolViolation(
                "cannot complete handshake: not in Handshaking state",
            )),
        }
    }

    /// Valid from: `Handshaking`, `Connected`.
    pub fn begin_disconnect(&mut self) -> Result<(), LoopError> {
        match self {
            Self::Handshaking | Self::Connected { .. } => {
                *self = Self::Disconnecting;
                Ok(())
            }
            _ => Err(LoopError::ProtocolViolation(
                "cannot disconnect: not in Handshaking or Connected state",
            )),
        }
    }

    /// Valid from: `Disconnecting`, and from `Connecting` / `Handshaking`
    /// on failure.
    pub fn finish_disconnect(&mut self) -> Result<(), LoopError> {
        match self {
            Self::Disconnecting | Self::Connecting | Self::Handshaking => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(LoopError::ProtocolViolation(
                "cannot finish disconnect: not in a disconnectable state",
            )),
        }
    }

    /// Reset to `Disconnected` after an I/O failure.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_lifecycle() {
        let mut phase = ConnectionPhase::default();
        phase.begin_connect().unwrap();
        phase.begin_handshake().unwrap();
        phase.complete_handshake(7).unwrap();
        assert_eq!(phase.session(), Some(7));
        assert!(phase.connected_duration().is_some());

        phase.begin_disconnect().unwrap();
        assert_eq!(phase, ConnectionPhase::Disconnecting);
        phase.finish_disconnect().unwrap();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn second_hello_is_a_violation() {
        let mut phase = ConnectionPhase::accepted();
        phase.complete_handshake(1).unwrap();
        assert!(matches!(
            phase.complete_handshake(2),
            Err(LoopError::ProtocolViolation(_))
        ));
        assert_eq!(phase.session(), Some(1));
    }

    #[test]
    fn invalid_transitions() {
        let mut phase = ConnectionPhase::Disconnected;
        assert!(phase.begin_handshake().is_err());
        assert!(phase.begin_disconnect().is_err());

        let mut phase = ConnectionPhase::Connecting;
        assert!(phase.complete_handshake(1).is_err());
        phase.finish_disconnect().unwrap();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn force_disconnect_from_connected() {
        let mut phase = ConnectionPhase::accepted();
        phase.complete_handshake(3).unwrap();
        phase.force_disconnect();
        assert!(phase.is_disconnected());
        assert_eq!(phase.session(), None);
    }

    #[test]
    fn display_includes_session() {
        let mut phase = ConnectionPhase::accepted();
        assert_eq!(phase.to_string(), "Handshaking");
        phase.complete_handshake(42).unwrap();
        assert_eq!(phase.to_string(), "Connected(session 42)");
    }
}
