//! Bounded command queue shared by the network tasks and the GUI thread.
//!
//! Many producers (one per connection task) and a single consumer (the
//! event loop bridge). Each session owns a FIFO lane; `dequeue_next`
//! walks the lanes round-robin so one busy client cannot starve the rest.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::command::{Command, SessionId};
use crate::error::LoopError;

/// Called after every successful enqueue, from the producer's thread.
///
/// A GUI host installs one to wake its event loop.
pub type LoopWaker = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct QueueInner {
    lanes: HashMap<SessionId, VecDeque<Command>>,
    /// Sessions with pending commands, in service order.
    ready: VecDeque<SessionId>,
    len: usize,
    closed: bool,
}

pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    wakers: Mutex<Vec<LoopWaker>>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity: capacity.max(1),
            wakers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waker invoked on every enqueue.
    pub fn on_enqueue<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }

    /// Append `command` to its session's lane.
    ///
    /// Never blocks. Fails with `QueueFull` at capacity, `Draining` after
    /// [`close`](Self::close), and `OutOfOrder` if the id does not exceed
    /// the last id already in the lane.
    pub fn enqueue(&self, command: Command) -> Result<(), LoopError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(LoopError::Draining);
            }
            if inner.len >= self.capacity {
                return Err(LoopError::QueueFull {
                    capacity: self.capacity,
                });
            }

            let session = command.session();
            let lane = inner.lanes.entry(session).or_default();
            if let Some(last) = lane.back() {
                if last.id() >= command.id() {
                    return Err(LoopError::OutOfOrder {
                        id: command.id(),
                        highest: last.id(),
                    });
                }
            }
            let was_empty = lane.is_empty();
            lane.push_back(command);
            if was_empty {
                inner.ready.push_back(session);
            }
            inner.len += 1;
        }

        for wake in self
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            wake();
        }
        Ok(())
    }

    /// Take the next command in round-robin order across sessions.
    pub fn dequeue_next(&self) -> Option<Command> {
        let mut inner = self.lock();
        let session = inner.ready.pop_front()?;
        let lane = inner.lanes.get_mut(&session)?;
        let command = lane.pop_front()?;
        if lane.is_empty() {
            inner.lanes.remove(&session);
        } else {
            inner.ready.push_back(session);
        }
        inner.len -= 1;
        Some(command)
    }

    /// Drop every pending command of `session`, returning them in order.
    pub fn purge(&self, session: SessionId) -> Vec<Command> {
        let mut inner = self.lock();
        let Some(lane) = inner.lanes.remove(&session) else {
            return Vec::new();
        };
        inner.ready.retain(|s| *s != session);
        inner.len -= lane.len();
        lane.into()
    }

    /// Refuse further commands and hand back everything still pending.
    pub fn close(&self) -> Vec<Command> {
        let mut inner = self.lock();
        inner.closed = true;
        let mut drained = Vec::with_capacity(inner.len);
        while let Some(session) = inner.ready.pop_front() {
            if let Some(lane) = inner.lanes.remove(&session) {
                drained.extend(lane);
            }
        }
        inner.len = 0;
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of commands waiting for `session`.
    pub fn pending_for(&self, session: SessionId) -> usize {
        self.lock().lanes.get(&session).map_or(0, VecDeque::len)
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CommandQueue")
            .field("len", &inner.len)
            .field("capacity", &self.capacity)
            .field("sessions", &inner.ready.len())
            .field("closed", &inner.closed)
            .finish()
    }
}
