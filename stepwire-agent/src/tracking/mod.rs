//! Section lifecycle and status aggregation.
//!
//! Statuses only ever move up `unknown < not_started < passed < warning <
//! failed < stopped`. They flow from a child into its enclosing open section,
//! along the compound chain, and into the run verdict.

pub mod aggregator;
mod compound;
mod run_state;
mod stack;
mod tracker;

pub use compound::CompoundChain;
pub use run_state::{ClosedSection, RunState};
pub use stack::{OpenSection, SectionStack};
pub use tracker::{RecordSink, StepTracker};
