//! Status merge policy.
//!
//! Every propagation point (child → enclosing section, section → compound
//! chain, section → run aggregate, run aggregate → run record) goes through
//! [`merge_into`], so a status can only move up the severity order
//! `unknown < not_started < passed < warning < failed < stopped`.

use stepwire_types::TestingStatus;

/// Apply `incoming` to `target` if it ranks strictly higher.
///
/// Returns true when `target` changed.
pub fn merge_into(target: &mut TestingStatus, incoming: TestingStatus) -> bool {
    if incoming.rank() > target.rank() {
        *target = incoming;
        true
    } else {
        false
    }
}

/// Running maximum of every status observed for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusWatermark {
    current: TestingStatus,
    observed: u64,
}

impl StatusWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed status. Returns true when the watermark rose.
    pub fn observe(&mut self, status: TestingStatus) -> bool {
        self.observed += 1;
        merge_into(&mut self.current, status)
    }

    pub fn current(&self) -> TestingStatus {
        self.current
    }

    /// Number of statuses observed so far
    pub fn observed(&self) -> u64 {
        self.observed
    }
}
