//! Background thread hosting every flush task.
//!
//! A single OS thread runs a current-thread tokio runtime. Callers never need a
//! runtime of their own: tasks are spawned through the runtime handle from any
//! thread.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

const THREAD_NAME: &str = "stepwire-flush";

pub struct BatchScheduler {
    handle: Handle,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
    scheduled: Arc<AtomicUsize>,
}

impl BatchScheduler {
    pub fn start() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name(THREAD_NAME)
            .build()?;
        let handle = runtime.handle().clone();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(token.cancelled());
                log::debug!("[DELIVERY] Flush scheduler stopped");
            })?;

        log::debug!("[DELIVERY] Flush scheduler started");
        Ok(Self {
            handle,
            shutdown,
            thread: Mutex::new(Some(thread)),
            scheduled: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Token cancelled when the scheduler shuts down. Per-run tokens are
    /// children of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run `task` on the flush thread until it completes or the scheduler
    /// shuts down.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scheduled = self.scheduled.clone();
        let shutdown = self.shutdown.clone();
        scheduled.fetch_add(1, Ordering::SeqCst);
        self.handle.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = task => {}
            }
            scheduled.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Number of spawned tasks that have not finished
    pub fn scheduled_tasks(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every task and join the flush thread.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            log::error!("[DELIVERY] Flush thread panicked");
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_spawn_runs_on_flush_thread() {
        let scheduler = BatchScheduler::start().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        scheduler.spawn(async move {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some(THREAD_NAME));
    }

    #[test]
    fn test_shutdown_cancels_pending_tasks() {
        let scheduler = BatchScheduler::start().unwrap();
        scheduler.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(scheduler.scheduled_tasks(), 1);

        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        // idempotent
        scheduler.shutdown();
    }
}
