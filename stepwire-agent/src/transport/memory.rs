use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use stepwire_types::RunId;

use super::{SerializedRecord, Transport, TransportError};

/// Keeps every delivered batch in memory.
///
/// Can be told to reject the next N sends, which the delivery tests use to
/// check that a failed batch is dropped without touching the others.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    batches: Mutex<Vec<(RunId, Vec<SerializedRecord>)>>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` sends
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Batches delivered for one run
    pub fn batches_for(&self, run_id: &RunId) -> Vec<Vec<SerializedRecord>> {
        self.batches
            .lock()
            .iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, batch)| batch.clone())
            .collect()
    }

    /// Delivered records for one run, flattened
    pub fn records_for(&self, run_id: &RunId) -> Vec<SerializedRecord> {
        self.batches_for(run_id).into_iter().flatten().collect()
    }

    /// Number of sends attempted, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_batch(
        &self,
        run_id: &RunId,
        batch: Vec<SerializedRecord>,
    ) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Rejected(format!(
                "memory transport told to fail ({} records)",
                batch.len()
            )));
        }
        self.batches.lock().push((run_id.clone(), batch));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
