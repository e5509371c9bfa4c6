//! Streaming of test-execution telemetry.
//!
//! Test adapters report nested sections and leaf messages through a
//! [`Reporter`]. Statuses are aggregated up the section tree, the compound
//! chain and into a run verdict, while records are batched per run and
//! shipped from a background thread so the test process never waits on the
//! network.

pub mod config;
pub mod delivery;
pub mod error;
pub mod records;
pub mod reporter;
pub mod script;
pub mod tracking;
pub mod transport;

pub use config::{Config, DeliveryConfig};
pub use delivery::{DeliveryService, RunQueueState, StopOutcome};
pub use error::{Result, StepwireError};
pub use records::{LeafInput, RecordFactory, SectionInput};
pub use reporter::{Reporter, RunOutcome};
pub use tracking::{RecordSink, StepTracker};
pub use transport::{HttpTransport, LogTransport, MemoryTransport, Transport, TransportError};

pub use stepwire_types::{ExecutionStatus, Record, RecordKind, RunId, TestingStatus};
