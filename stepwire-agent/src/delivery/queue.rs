//! Per-run delivery queue.
//!
//! Producers push through an unbounded mpsc sender, the run's flush task owns
//! the receiver. `pending` counts records offered but not yet through a
//! transport call; it only reaches zero once everything offered has been sent
//! or dropped, which is what `stop` waits for.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use stepwire_types::{Record, RunId};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StepwireError};

/// Lifecycle of one run's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunQueueState {
    Unregistered,
    Active,
    Draining,
    Removed,
}

impl std::fmt::Display for RunQueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunQueueState::Unregistered => "unregistered",
            RunQueueState::Active => "active",
            RunQueueState::Draining => "draining",
            RunQueueState::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

pub struct RunQueue {
    run_id: RunId,
    sender: mpsc::UnboundedSender<Record>,
    /// Offers hold the read side, state transitions the write side
    state: RwLock<RunQueueState>,
    pending: AtomicUsize,
    drained: Mutex<()>,
    drained_cv: Condvar,
    flush_now: Notify,
    cancel: CancellationToken,
}

impl RunQueue {
    /// Create an active queue. The receiver goes to the run's flush task.
    pub fn new(
        run_id: RunId,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            run_id,
            sender,
            state: RwLock::new(RunQueueState::Active),
            pending: AtomicUsize::new(0),
            drained: Mutex::new(()),
            drained_cv: Condvar::new(),
            flush_now: Notify::new(),
            cancel,
        };
        (queue, receiver)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn state(&self) -> RunQueueState {
        *self.state.read()
    }

    /// Records offered and not yet handed to the transport
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Append a record. Never blocks on the queue itself.
    pub fn offer(&self, record: Record) -> Result<()> {
        let state = self.state.read();
        if !matches!(*state, RunQueueState::Active | RunQueueState::Draining) {
            return Err(StepwireError::contract(&self.run_id, "run is not active"));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(record).is_err() {
            self.mark_flushed(1);
            return Err(StepwireError::contract(&self.run_id, "run queue is closed"));
        }
        Ok(())
    }

    /// Account for `count` records that went through a send attempt.
    pub fn mark_flushed(&self, count: usize) {
        if count == 0 {
            return;
        }
        let before = self.pending.fetch_sub(count, Ordering::SeqCst);
        if before == count {
            self.notify_drained();
        }
    }

    /// ACTIVE -> DRAINING and ask the flush task for an early tick.
    /// Returns false once the queue is removed.
    pub fn begin_drain(&self) -> bool {
        let mut state = self.state.write();
        match *state {
            RunQueueState::Active => {
                *state = RunQueueState::Draining;
                self.request_flush();
                true
            }
            RunQueueState::Draining => true,
            RunQueueState::Unregistered | RunQueueState::Removed => false,
        }
    }

    /// Ask the flush task for a tick now. Requests made before the task
    /// listens are kept, several of them collapse into one.
    pub fn request_flush(&self) {
        self.flush_now.notify_one();
    }

    /// Resolves when a drain asked for an early tick
    pub async fn flush_requested(&self) {
        self.flush_now.notified().await
    }

    /// Wait until the queue is observed empty, at most `timeout`.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let mut guard = self.drained.lock();
        if self.pending() == 0 {
            return true;
        }
        self.drained_cv.wait_for(&mut guard, timeout);
        self.pending() == 0
    }

    /// DRAINING -> REMOVED, provided nothing is pending.
    ///
    /// Offers hold the state read lock across their pending increment, so a
    /// zero seen under the write lock means every accepted record was sent.
    pub fn try_remove(&self) -> bool {
        let mut state = self.state.write();
        if self.pending() != 0 {
            return false;
        }
        *state = RunQueueState::Removed;
        true
    }

    /// Leak guard: remove the queue whatever is pending. Returns the number of
    /// records abandoned.
    pub fn expire(&self) -> usize {
        {
            let mut state = self.state.write();
            *state = RunQueueState::Removed;
        }
        self.cancel.cancel();
        self.notify_drained();
        self.pending()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn notify_drained(&self) {
        let _guard = self.drained.lock();
        self.drained_cv.notify_all();
    }
}
