//! Per-run registry tying queues to their flush tasks.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepwire_types::{Record, RunId};

use super::flush::{LoopExit, run_flush_loop};
use super::queue::{RunQueue, RunQueueState};
use super::scheduler::BatchScheduler;
use crate::config::DeliveryConfig;
use crate::error::{Result, StepwireError};
use crate::tracking::RecordSink;
use crate::transport::Transport;

/// How a `stop` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every offered record went through a send attempt.
    Drained,
    /// The run was cancelled before the queue emptied; `dropped` records
    /// were never sent.
    Abandoned { dropped: usize },
    /// Nothing was registered for the run.
    NotRunning,
}

/// Batches records per run and ships them from the background flush thread.
pub struct DeliveryService {
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
    /// Run ID -> queue, shared with the flush tasks for leak-guard removal
    queues: Arc<DashMap<RunId, Arc<RunQueue>>>,
    scheduler: BatchScheduler,
}

impl DeliveryService {
    pub fn new(config: DeliveryConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let scheduler = BatchScheduler::start()?;
        log::info!(
            "[DELIVERY] Using {} transport, batch size {}, flush every {:?}",
            transport.name(),
            config.batch_size,
            config.flush_interval
        );
        Ok(Self {
            config,
            transport,
            queues: Arc::new(DashMap::new()),
            scheduler,
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Register a queue and a flush task for `run_id`. No-op if already active.
    ///
    /// Rejected once the service has been shut down.
    pub fn start(&self, run_id: &RunId) -> Result<()> {
        let entry = self.queues.entry(run_id.clone());
        // checked under the shard lock: a concurrent shutdown clears the map
        // only after cancelling, so anything inserted past this point is cleared
        if self.scheduler.is_shut_down() {
            return Err(StepwireError::contract(run_id, "delivery is shut down"));
        }
        match entry {
            Entry::Occupied(mut entry) => match entry.get().state() {
                RunQueueState::Active => {
                    log::debug!("[DELIVERY] Run {} already active", run_id);
                    Ok(())
                }
                RunQueueState::Draining => {
                    Err(StepwireError::contract(run_id, "run is still draining"))
                }
                // Removed but not yet unlinked: replace it
                RunQueueState::Removed | RunQueueState::Unregistered => {
                    let queue = self.spawn_queue(run_id);
                    entry.insert(queue);
                    log::info!("[DELIVERY] Run {} restarted", run_id);
                    Ok(())
                }
            },
            Entry::Vacant(entry) => {
                let queue = self.spawn_queue(run_id);
                entry.insert(queue);
                log::info!("[DELIVERY] Run {} started", run_id);
                Ok(())
            }
        }
    }

    /// Append a record to the run's queue.
    pub fn offer(&self, record: Record, run_id: &RunId) -> Result<()> {
        let queue = self
            .queues
            .get(run_id)
            .map(|q| q.value().clone())
            .ok_or_else(|| StepwireError::contract(run_id, "run is not active"))?;
        queue.offer(record)
    }

    /// Drain the run's queue, then cancel its flush task and forget it.
    ///
    /// Blocks the calling thread until every record offered so far, including
    /// records offered while draining, has been through a send attempt.
    pub fn stop(&self, run_id: &RunId) -> StopOutcome {
        let Some(queue) = self.queues.get(run_id).map(|q| q.value().clone()) else {
            log::warn!("[DELIVERY] Stop requested for unknown run {}", run_id);
            return StopOutcome::NotRunning;
        };
        if !queue.begin_drain() {
            log::debug!("[DELIVERY] Run {} already removed", run_id);
            return StopOutcome::NotRunning;
        }
        log::info!(
            "[DELIVERY] Draining run {} ({} pending)",
            run_id,
            queue.pending()
        );

        let outcome = loop {
            if queue.is_cancelled() {
                let dropped = queue.pending();
                log::warn!(
                    "[DELIVERY] Run {} cancelled while draining, {} record(s) dropped",
                    run_id,
                    dropped
                );
                break StopOutcome::Abandoned { dropped };
            }
            if queue.wait_drained(self.config.flush_interval) && queue.try_remove() {
                break StopOutcome::Drained;
            }
        };

        queue.cancel();
        self.queues.remove_if(run_id, |_, q| Arc::ptr_eq(q, &queue));
        log::info!("[DELIVERY] Run {} stopped", run_id);
        outcome
    }

    /// Lifecycle state of a run's queue
    pub fn state(&self, run_id: &RunId) -> RunQueueState {
        self.queues
            .get(run_id)
            .map(|q| q.state())
            .unwrap_or(RunQueueState::Unregistered)
    }

    /// Records of `run_id` not yet through a send attempt
    pub fn pending(&self, run_id: &RunId) -> usize {
        self.queues.get(run_id).map(|q| q.pending()).unwrap_or(0)
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Flush tasks currently scheduled
    pub fn scheduled_tasks(&self) -> usize {
        self.scheduler.scheduled_tasks()
    }

    /// Cancel every run and stop the flush thread. Unsent records are lost.
    pub fn shutdown(&self) {
        let runs = self.queues.len();
        if runs > 0 {
            log::warn!("[DELIVERY] Shutting down with {} run(s) still registered", runs);
        }
        self.scheduler.shutdown();
        self.queues.clear();
    }

    fn spawn_queue(&self, run_id: &RunId) -> Arc<RunQueue> {
        let cancel = self.scheduler.shutdown_token().child_token();
        let (queue, receiver) = RunQueue::new(run_id.clone(), cancel);
        let queue = Arc::new(queue);

        let task_queue = queue.clone();
        let queues = self.queues.clone();
        let transport = self.transport.clone();
        let batch_size = self.config.batch_size;
        let flush_interval = self.config.flush_interval;
        let max_run_duration = self.config.max_run_duration;
        self.scheduler.spawn(async move {
            let exit = run_flush_loop(
                task_queue.clone(),
                receiver,
                transport,
                batch_size,
                flush_interval,
                max_run_duration,
            )
            .await;

            if let LoopExit::Expired { dropped } = exit {
                let run_id = task_queue.run_id().clone();
                queues.remove_if(&run_id, |_, q| Arc::ptr_eq(q, &task_queue));
                log::warn!(
                    "[DELIVERY] Run {} exceeded {:?} without stop, removed ({} record(s) dropped)",
                    run_id,
                    max_run_duration,
                    dropped
                );
            }
        });

        queue
    }
}

impl RecordSink for DeliveryService {
    fn offer(&self, record: Record, run_id: &RunId) -> Result<()> {
        DeliveryService::offer(self, record, run_id)
    }

    fn accepts(&self, run_id: &RunId) -> bool {
        matches!(
            self.state(run_id),
            RunQueueState::Active | RunQueueState::Draining
        )
    }
}
