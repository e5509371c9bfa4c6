//! The periodic drain-and-send routine of one run.

use std::sync::Arc;
use std::time::Duration;

use stepwire_types::Record;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, MissedTickBehavior};

use super::queue::{RunQueue, RunQueueState};
use crate::transport::{SerializedRecord, Transport};

/// Counters for one flush tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub batches_sent: usize,
    pub records_sent: usize,
    pub records_dropped: usize,
    /// The run was cancelled or hit its deadline mid-tick
    pub interrupted: bool,
}

impl FlushStats {
    pub fn is_empty(&self) -> bool {
        self.batches_sent == 0 && self.records_sent == 0 && self.records_dropped == 0
    }
}

/// Why a flush loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The run was stopped or the scheduler shut down.
    Cancelled,
    /// The leak guard fired.
    Expired { dropped: usize },
}

/// Send the records queued when the tick starts, a batch every time
/// `batch_size` records are collected and the remainder at the end.
///
/// Records offered during the tick wait for the next one. Every send races
/// the run's cancellation and `deadline`; when either wins the tick returns
/// at once and the unsent records stay pending.
pub async fn flush_tick(
    queue: &RunQueue,
    receiver: &mut UnboundedReceiver<Record>,
    transport: &dyn Transport,
    batch_size: usize,
    deadline: Instant,
) -> FlushStats {
    let batch_size = batch_size.max(1);
    let mut stats = FlushStats::default();
    let mut batch = Vec::with_capacity(batch_size);
    let mut budget = queue.pending();

    while budget > 0 {
        let Ok(record) = receiver.try_recv() else {
            break;
        };
        budget -= 1;
        batch.push(record);
        if batch.len() >= batch_size
            && !send(queue, transport, std::mem::take(&mut batch), deadline, &mut stats).await
        {
            return stats;
        }
    }
    if !batch.is_empty() {
        send(queue, transport, batch, deadline, &mut stats).await;
    }

    stats
}

/// Returns false when the send was cut short.
async fn send(
    queue: &RunQueue,
    transport: &dyn Transport,
    batch: Vec<Record>,
    deadline: Instant,
    stats: &mut FlushStats,
) -> bool {
    let taken = batch.len();
    let mut serialized: Vec<SerializedRecord> = Vec::with_capacity(taken);
    for record in batch {
        match serde_json::to_value(&record) {
            Ok(value) => serialized.push(value),
            Err(e) => {
                log::error!(
                    "[DELIVERY] Run {}: dropping record {} that failed to serialize: {}",
                    queue.run_id(),
                    record.id,
                    e
                );
                stats.records_dropped += 1;
            }
        }
    }

    if !serialized.is_empty() {
        let count = serialized.len();
        let result = tokio::select! {
            biased;
            _ = queue.cancellation().cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => None,
            result = transport.send_batch(queue.run_id(), serialized) => Some(result),
        };
        match result {
            Some(Ok(())) => {
                stats.batches_sent += 1;
                stats.records_sent += count;
            }
            Some(Err(e)) => {
                log::warn!(
                    "[DELIVERY] Run {}: {} transport failed, dropped batch of {} record(s): {}",
                    queue.run_id(),
                    transport.name(),
                    count,
                    e
                );
                stats.records_dropped += count;
            }
            None => {
                log::debug!(
                    "[DELIVERY] Run {}: send of {} record(s) interrupted",
                    queue.run_id(),
                    count
                );
                stats.interrupted = true;
                return false;
            }
        }
    }

    queue.mark_flushed(taken);
    true
}

/// Tick every `flush_interval` (first tick immediately) until the run is
/// cancelled or `max_run_duration` passes. A drain request runs an extra tick
/// right away, and keeps ticking back to back until the queue is empty. A
/// tick still sending when the deadline passes is cut short.
pub async fn run_flush_loop(
    queue: Arc<RunQueue>,
    mut receiver: UnboundedReceiver<Record>,
    transport: Arc<dyn Transport>,
    batch_size: usize,
    flush_interval: Duration,
    max_run_duration: Duration,
) -> LoopExit {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let deadline = Instant::now() + max_run_duration;
    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);

    let exit = loop {
        tokio::select! {
            biased;
            _ = queue.cancellation().cancelled() => break LoopExit::Cancelled,
            _ = &mut expiry => {
                let dropped = queue.expire();
                break LoopExit::Expired { dropped };
            }
            _ = ticker.tick() => {}
            _ = queue.flush_requested() => {}
        }

        let stats = flush_tick(
            &queue,
            &mut receiver,
            transport.as_ref(),
            batch_size,
            deadline,
        )
        .await;
        // records offered while draining must not wait for the next interval
        if queue.state() == RunQueueState::Draining && queue.pending() > 0 {
            queue.request_flush();
        }
        if !stats.is_empty() {
            log::debug!(
                "[DELIVERY] Run {}: flushed {} record(s) in {} batch(es), dropped {}",
                queue.run_id(),
                stats.records_sent,
                stats.batches_sent,
                stats.records_dropped
            );
        }
    };

    log::debug!("[DELIVERY] Run {}: flush loop ended ({:?})", queue.run_id(), exit);
    exit
}
