use async_trait::async_trait;
use stepwire_types::RunId;

use super::{SerializedRecord, Transport, TransportError};

/// Writes every batch to the log instead of sending it. Used for dry runs.
#[derive(Debug, Default)]
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send_batch(
        &self,
        run_id: &RunId,
        batch: Vec<SerializedRecord>,
    ) -> Result<(), TransportError> {
        log::info!("[TRANSPORT] Run {}: batch of {} record(s)", run_id, batch.len());
        for record in &batch {
            log::debug!("[TRANSPORT]   {}", record);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
