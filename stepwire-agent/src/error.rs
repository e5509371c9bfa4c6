//! Errors surfaced by the agent.
//!
//! Only caller misuse is returned. Transport failures and stack underflows are
//! recovered where they happen and end up in the log.

use stepwire_types::RunId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepwireError {
    /// The caller used a run that is not in a state accepting the call
    /// (never started, already stopped, or still draining).
    #[error("contract violation for run {run_id}: {reason}")]
    ContractViolation { run_id: RunId, reason: &'static str },

    /// `close_section` with no open section. Logged, never returned.
    #[error("run {run_id}: close_section called with no open section")]
    StackUnderflow { run_id: RunId },

    /// The background flush thread could not be started.
    #[error("failed to start flush scheduler: {0}")]
    Scheduler(#[from] std::io::Error),
}

impl StepwireError {
    pub fn contract(run_id: &RunId, reason: &'static str) -> Self {
        StepwireError::ContractViolation {
            run_id: run_id.clone(),
            reason,
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, StepwireError::ContractViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, StepwireError>;
