//! Client-side tracking of commands awaiting a Response.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::LoopError;
use crate::message::{CommandFrame, ResponseFrame};

/// What a waiter receives: the Response, or why none will come.
pub type Outcome = Result<ResponseFrame, LoopError>;

/// A command that was sent and not yet answered.
#[derive(Debug)]
pub struct TrackedCommand {
    pub frame: CommandFrame,
    pub sent_at: Instant,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

impl TrackedCommand {
    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    fn finish(self, outcome: impl Fn() -> Outcome) {
        for waiter in self.waiters {
            let _ = waiter.send(outcome());
        }
    }
}

/// Outstanding commands keyed by id, in id order.
#[derive(Debug, Default)]
pub struct PendingCommands {
    commands: BTreeMap<u64, TrackedCommand>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `frame`; the receiver resolves when its Response arrives.
    ///
    /// Tracking an id twice (a replay) adds a second waiter for the same
    /// single Response.
    pub fn track(&mut self, frame: CommandFrame) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .entry(frame.id)
            .or_insert_with(|| TrackedCommand {
                frame,
                sent_at: Instant::now(),
                waiters: Vec::new(),
            })
            .waiters
            .push(tx);
        rx
    }

    /// Hand `response` to whoever is waiting for it. Returns `false` for
    /// an id nobody is tracking (a late or duplicate answer).
    pub fn resolve(&mut self, response: ResponseFrame) -> bool {
        match self.commands.remove(&response.command_id) {
            Some(tracked) => {
                tracked.finish(|| Ok(response.clone()));
                true
            }
            None => false,
        }
    }

    /// Stop tracking `id` and fail its waiter with `Timeout`.
    pub fn expire(&mut self, id: u64) -> Option<Duration> {
        let tracked = self.commands.remove(&id)?;
        let waited = tracked.elapsed();
        tracked.finish(|| Err(LoopError::Timeout(waited)));
        Some(waited)
    }

    /// Frames with an id above `watermark`, for resending after a resume.
    pub fn unapplied_after(&self, watermark: u64) -> Vec<CommandFrame> {
        self.commands
            .range(watermark.saturating_add(1)..)
            .map(|(_, t)| t.frame.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.commands.contains_key(&id)
    }

    /// Fail every waiter, e.g. when the server went away for good.
    pub fn fail_all(&mut self, connection: u64) -> usize {
        let n = self.commands.len();
        for (_, tracked) in std::mem::take(&mut self.commands) {
            tracked.finish(|| Err(LoopError::ConnectionClosed(connection)));
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CommandKind, Status};

    fn frame(id: u64) -> CommandFrame {
        CommandFrame {
            id,
            kind: CommandKind::Ping,
            args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn resolve_wakes_waiter() {
        let mut pending = PendingCommands::new();
        let rx = pending.track(frame(1));
        assert!(pending.is_pending(1));
        assert!(pending.resolve(ResponseFrame::ok(1, b"pong".to_vec())));
        assert_eq!(rx.await.unwrap().unwrap().result, b"pong");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn replayed_id_wakes_both_waiters() {
        let mut pending = PendingCommands::new();
        let first = pending.track(frame(3));
        let second = pending.track(frame(3));
        assert_eq!(pending.len(), 1);
        pending.resolve(ResponseFrame::rejected(3, Status::Stale, "applied"));
        assert_eq!(first.await.unwrap().unwrap().status, Status::Stale);
        assert_eq!(second.await.unwrap().unwrap().status, Status::Stale);
    }

    #[test]
    fn unknown_response_is_ignored() {
        let mut pending = PendingCommands::new();
        assert!(!pending.resolve(ResponseFrame::ok(9, Vec::new())));
    }

    #[test]
    fn unapplied_after_watermark() {
        let mut pending = PendingCommands::new();
        for id in 4..=7 {
            let _ = pending.track(frame(id));
        }
        let ids: Vec<u64> = pending.unapplied_after(5).iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![6, 7]);
    }

    #[test]
    fn expire_reports_timeout() {
        let mut pending = PendingCommands::new();
        let mut rx = pending.track(frame(1));
        assert!(pending.expire(1).is_some());
        assert!(pending.expire(1).is_none());
        assert!(matches!(rx.try_recv(), Ok(Err(LoopError::Timeout(_)))));
    }

    #[test]
    fn fail_all_reports_closed_connection() {
        let mut pending = PendingCommands::new();
        let mut a = pending.track(frame(1));
        let mut b = pending.track(frame(2));
        assert_eq!(pending.fail_all(0), 2);
        assert!(matches!(a.try_recv(), Ok(Err(LoopError::ConnectionClosed(0)))));
        assert!(matches!(b.try_recv(), Ok(Err(LoopError::ConnectionClosed(0)))));
    }
}
