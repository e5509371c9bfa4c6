//! Asynchronous batching and delivery of records.
//!
//! ## Flow
//! 1. `start` registers a queue and a flush task for the run
//! 2. `offer` appends records without blocking
//! 3. every `flush_interval` the run's flush task sends the records queued at
//!    that moment in batches of `batch_size`
//! 4. `stop` waits until the queue is empty, then cancels the task
//!
//! A run that is never stopped is cancelled after `max_run_duration`, even in
//! the middle of a send.

mod flush;
mod queue;
mod scheduler;
mod service;


pub use flush::{FlushStats, LoopExit, flush_tick, run_flush_loop};
pub use queue::{RunQueue, RunQueueState};
pub use scheduler::BatchScheduler;
pub use service::{DeliveryService, StopOutcome};
