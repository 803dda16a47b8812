//! Fixed-size worker pool for command handlers too slow for the GUI thread.
//!
//! Jobs run on the runtime's blocking threads, at most `size` at a time.
//! The GUI thread submits through a runtime [`Handle`] and collects
//! results with [`WorkerPool::poll_completions`], which never blocks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::SessionId;
use crate::error::WorkerError;

/// Blocking work delegated by a handler.
pub type Job = Box<dyn FnOnce() -> Result<Vec<u8>, String> + Send + 'static>;

/// Identifies one delegated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub session: SessionId,
    pub command_id: u64,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.command_id)
    }
}

#[derive(Debug)]
pub struct Completion {
    pub key: TaskKey,
    pub result: Result<Vec<u8>, WorkerError>,
}

pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
    tasks: HashMap<TaskKey, JoinHandle<()>>,
    done_tx: mpsc::Sender<Completion>,
    done_rx: mpsc::Receiver<Completion>,
}

impl WorkerPool {
    pub fn new(size: usize, handle: Handle) -> Self {
        let size = size.max(1);
        let (done_tx, done_rx) = mpsc::channel(1024);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
            tasks: HashMap::new(),
            done_tx,
            done_rx,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs submitted and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start `job`; its result arrives later through `poll_completions`.
    pub fn submit(&mut self, key: TaskKey, job: Job) {
        let permits = Arc::clone(&self.permits);
        let done_tx = self.done_tx.clone();

        let task = self.handle.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => match tokio::task::spawn_blocking(job).await {
                    Ok(Ok(bytes)) => Ok(bytes),
                    Ok(Err(message)) => Err(WorkerError::Failed(message)),
                    Err(e) if e.is_panic() => Err(WorkerError::Panicked(panic_message(e.into_panic()))),
                    Err(_) => Err(WorkerError::Cancelled),
                },
                Err(_) => Err(WorkerError::Cancelled),
            };
            let _ = done_tx.send(Completion { key, result }).await;
        });

        debug!("worker job {key} submitted");
        if let Some(previous) = self.tasks.insert(key, task) {
            warn!("worker job {key} replaced a running job");
            previous.abort();
        }
    }

    /// Collect up to `max` finished jobs without waiting.
    pub fn poll_completions(&mut self, max: usize) -> Vec<Completion> {
        let mut out = Vec::new();
        while out.len() < max {
            let Ok(completion) = self.done_rx.try_recv() else {
                break;
            };
            // Cancelled jobs may still report; their answer was already sent.
            if self.tasks.remove(&completion.key).is_some() {
                out.push(completion);
            }
        }
        out
    }

    /// Abort every outstanding job and return their keys.
    ///
    /// Work already running on a blocking thread finishes in the
    /// background, but its result is discarded.
    pub fn cancel_all(&mut self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.tasks.keys().copied().collect();
        keys.sort();
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        keys
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("in_flight", &self.tasks.len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
