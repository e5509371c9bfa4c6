//! Entry point for test adapters: section tracking wired to delivery.

use std::sync::Arc;

use stepwire_types::{Record, RunId, TestingStatus};

use crate::config::DeliveryConfig;
use crate::delivery::{DeliveryService, RunQueueState, StopOutcome};
use crate::error::Result;
use crate::records::{LeafInput, SectionInput};
use crate::tracking::StepTracker;
use crate::transport::Transport;

/// Result of finishing a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The finished run record, carrying the run verdict
    pub record: Record,
    pub delivery: StopOutcome,
}

impl RunOutcome {
    pub fn status(&self) -> TestingStatus {
        self.record.testing_status
    }
}

pub struct Reporter {
    tracker: StepTracker,
    delivery: Arc<DeliveryService>,
}

impl Reporter {
    pub fn new(config: DeliveryConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let delivery = Arc::new(DeliveryService::new(config, transport)?);
        Ok(Self::with_delivery(delivery))
    }

    pub fn with_delivery(delivery: Arc<DeliveryService>) -> Self {
        Self {
            tracker: StepTracker::new(delivery.clone()),
            delivery,
        }
    }

    /// Start delivery for the run and emit its run record.
    ///
    /// Tracking state left behind by a run whose delivery already ended is
    /// discarded, so the run starts over.
    pub fn start_run(&self, run_id: &RunId) -> Result<Record> {
        let delivering = matches!(
            self.delivery.state(run_id),
            RunQueueState::Active | RunQueueState::Draining
        );
        self.delivery.start(run_id)?;
        if !delivering && self.tracker.discard(run_id) {
            log::warn!("[TRACKER] Run {} restarted after its delivery ended", run_id);
        }
        self.tracker.begin_run(run_id)
    }

    pub fn open_section(&self, run_id: &RunId, input: SectionInput) -> Result<Record> {
        self.tracker.open_section(run_id, input)
    }

    pub fn report_leaf(&self, run_id: &RunId, input: LeafInput) -> Result<Record> {
        self.tracker.report_leaf(run_id, input)
    }

    pub fn close_section(&self, run_id: &RunId) -> Result<Option<Record>> {
        self.tracker.close_section(run_id)
    }

    /// Emit the final run record and block until the run's queue is drained.
    pub fn finish_run(&self, run_id: &RunId) -> Result<RunOutcome> {
        let record = self.tracker.end_run(run_id)?;
        let delivery = self.delivery.stop(run_id);
        Ok(RunOutcome { record, delivery })
    }

    pub fn run_status(&self, run_id: &RunId) -> Option<TestingStatus> {
        self.tracker.run_status(run_id)
    }

    pub fn tracker(&self) -> &StepTracker {
        &self.tracker
    }

    pub fn delivery(&self) -> &DeliveryService {
        &self.delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::time::Duration;
    use stepwire_types::RecordKind;

    fn reporter() -> (Reporter, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let config = DeliveryConfig::new(3, Duration::from_millis(25));
        let reporter = Reporter::new(config, transport.clone()).unwrap();
        (reporter, transport)
    }

    #[test]
    fn test_run_end_to_end() {
        let (reporter, transport) = reporter();
        let run = RunId::from("e2e");

        reporter.start_run(&run).unwrap();
        reporter
            .open_section(&run, SectionInput::new("login").step())
            .unwrap();
        reporter
            .report_leaf(&run, LeafInput::new("fill form").with_status(TestingStatus::Passed))
            .unwrap();
        reporter
            .report_leaf(&run, LeafInput::new("slow redirect").with_status(TestingStatus::Warning))
            .unwrap();
        reporter.close_section(&run).unwrap();
        assert_eq!(reporter.run_status(&run), Some(TestingStatus::Warning));

        let outcome = reporter.finish_run(&run).unwrap();
        assert_eq!(outcome.status(), TestingStatus::Warning);
        assert_eq!(outcome.delivery, StopOutcome::Drained);

        // run, section, 2 leaves, section update, final run record
        let records = transport.records_for(&run);
        assert_eq!(records.len(), 6);
        let last = records.last().unwrap();
        assert_eq!(last["kind"], "run");
        assert_eq!(last["testing_status"], "warning");
        assert_eq!(last["execution_status"], "finished");
        assert_eq!(records[4]["name"], "login");
        assert_eq!(records[4]["revision"], 1);
    }

    #[test]
    fn test_calls_after_finish_are_rejected() {
        let (reporter, _transport) = reporter();
        let run = RunId::from("done");
        reporter.start_run(&run).unwrap();
        reporter.finish_run(&run).unwrap();

        assert!(
            reporter
                .open_section(&run, SectionInput::new("late"))
                .unwrap_err()
                .is_contract_violation()
        );
        assert!(reporter.finish_run(&run).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_start_run_twice_emits_one_run_record() {
        let (reporter, transport) = reporter();
        let run = RunId::from("dup");
        let first = reporter.start_run(&run).unwrap();
        let second = reporter.start_run(&run).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, RecordKind::Run);

        reporter.finish_run(&run).unwrap();
        let runs = transport
            .records_for(&run)
            .into_iter()
            .filter(|r| r["kind"] == "run")
            .count();
        assert_eq!(runs, 2);
    }

    #[test]
    fn test_expired_run_is_dropped_from_tracking() {
        let transport = Arc::new(MemoryTransport::new());
        let config = DeliveryConfig::new(3, Duration::from_millis(25))
            .with_max_run(Duration::from_millis(100));
        let reporter = Reporter::new(config, transport).unwrap();
        let run = RunId::from("expired");
        reporter.start_run(&run).unwrap();

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(reporter.delivery().state(&run), RunQueueState::Unregistered);

        for _ in 0..2 {
            assert!(
                reporter
                    .open_section(&run, SectionInput::new("late"))
                    .unwrap_err()
                    .is_contract_violation()
            );
        }
        assert_eq!(reporter.tracker().depth(&run), None);
        assert!(!reporter.tracker().is_tracking(&run));
        assert_eq!(reporter.run_status(&run), None);

        // the run id can be reused from scratch
        reporter.start_run(&run).unwrap();
        assert_eq!(reporter.tracker().depth(&run), Some(0));
        assert_eq!(reporter.finish_run(&run).unwrap().delivery, StopOutcome::Drained);
    }

    #[test]
    fn test_restart_after_expiry_starts_fresh() {
        let transport = Arc::new(MemoryTransport::new());
        let config = DeliveryConfig::new(3, Duration::from_millis(25))
            .with_max_run(Duration::from_millis(100));
        let reporter = Reporter::new(config, transport.clone()).unwrap();
        let run = RunId::from("rerun");
        reporter.start_run(&run).unwrap();
        reporter
            .report_leaf(&run, LeafInput::new("boom").with_status(TestingStatus::Failed))
            .unwrap();
        reporter.open_section(&run, SectionInput::new("abandoned")).unwrap();

        std::thread::sleep(Duration::from_millis(400));
        reporter.start_run(&run).unwrap();
        assert_eq!(reporter.tracker().depth(&run), Some(0));
        assert_eq!(reporter.run_status(&run), Some(TestingStatus::Unknown));

        let outcome = reporter.finish_run(&run).unwrap();
        assert_eq!(outcome.status(), TestingStatus::Unknown);
        // first start, restart, final
        let runs = transport
            .records_for(&run)
            .into_iter()
            .filter(|r| r["kind"] == "run")
            .count();
        assert_eq!(runs, 3);
    }
}
