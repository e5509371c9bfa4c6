//! Outbound side of delivery: something that ships one batch of records.
//!
//! The delivery scheduler only knows the [`Transport`] trait. A send either
//! succeeds or the batch is dropped; nothing here retries.

mod http;
mod logging;
mod memory;

use async_trait::async_trait;
use stepwire_types::RunId;
use thiserror::Error;

pub use self::http::HttpTransport;
pub use self::logging::LogTransport;
pub use self::memory::MemoryTransport;

/// One record as it travels over the wire
pub type SerializedRecord = serde_json::Value;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("batch rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one batch for `run_id`. The batch is dropped on error.
    async fn send_batch(
        &self,
        run_id: &RunId,
        batch: Vec<SerializedRecord>,
    ) -> Result<(), TransportError>;

    /// Short name used in log lines
    fn name(&self) -> &'static str;
}
