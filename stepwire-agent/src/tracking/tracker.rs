use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use stepwire_types::{Record, RunId, TestingStatus};

use super::run_state::RunState;
use crate::error::{Result, StepwireError};
use crate::records::{LeafInput, RecordFactory, SectionInput};

/// Destination for emitted records.
pub trait RecordSink: Send + Sync {
    /// Hand a record over for delivery. Must not block.
    fn offer(&self, record: Record, run_id: &RunId) -> Result<()>;

    /// Whether records for `run_id` can still be offered. The tracker drops
    /// the state of a run its sink no longer accepts.
    fn accepts(&self, _run_id: &RunId) -> bool {
        true
    }
}

/// Tracks the section tree of every running test run.
///
/// Each call locks the state of its own run only, so runs never contend with
/// each other. Calls for one run are applied in the order they acquire that
/// lock; interleaving open/close calls for the same run from several threads
/// is up to the caller to serialize.
pub struct StepTracker {
    sink: Arc<dyn RecordSink>,
    factory: RecordFactory,
    /// Run state indexed by run ID
    runs: DashMap<RunId, Arc<Mutex<RunState>>>,
}

impl StepTracker {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            sink,
            factory: RecordFactory::new(),
            runs: DashMap::new(),
        }
    }

    /// Create the state for a run and emit its run record.
    ///
    /// Calling it again for a tracked run returns the current run record
    /// without emitting anything.
    pub fn begin_run(&self, run_id: &RunId) -> Result<Record> {
        let state = match self.runs.entry(run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                log::debug!("[TRACKER] Run {} already tracked", run_id);
                return Ok(entry.get().lock().run_record().clone());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let state = RunState::new(run_id.clone(), self.factory, Utc::now());
                entry.insert(Arc::new(Mutex::new(state))).clone()
            }
        };

        let record = state.lock().run_record().clone();
        if let Err(e) = self.sink.offer(record.clone(), run_id) {
            self.runs.remove(run_id);
            return Err(e);
        }
        log::info!("[TRACKER] Run {} started", run_id);
        Ok(record)
    }

    /// Open a section in `run_id` and emit it.
    ///
    /// The section is only pushed once the sink took its record.
    pub fn open_section(&self, run_id: &RunId, input: SectionInput) -> Result<Record> {
        let state = self.state(run_id)?;
        let mut guard = state.lock();
        let record = guard.prepare_section(input, Utc::now());
        if let Err(e) = self.sink.offer(record.clone(), run_id) {
            drop(guard);
            self.release_if_rejected(run_id);
            return Err(e);
        }
        guard.commit_section(&record);
        log::debug!(
            "[TRACKER] Run {} opened section '{}' at depth {}",
            run_id,
            record.name,
            guard.depth()
        );
        Ok(record)
    }

    /// Report a finished leaf message in `run_id` and emit it.
    pub fn report_leaf(&self, run_id: &RunId, input: LeafInput) -> Result<Record> {
        let state = self.state(run_id)?;
        let mut guard = state.lock();
        let record = guard.prepare_leaf(input, Utc::now());
        if let Err(e) = self.sink.offer(record.clone(), run_id) {
            drop(guard);
            self.release_if_rejected(run_id);
            return Err(e);
        }
        guard.commit_leaf(&record);
        Ok(record)
    }

    /// Close the innermost open section of `run_id`.
    ///
    /// Returns the closed section, or None when nothing was open (logged, not
    /// an error). An update is emitted only when the section's status moved
    /// since it was opened or the section is a step boundary.
    pub fn close_section(&self, run_id: &RunId) -> Result<Option<Record>> {
        let state = self.state(run_id)?;
        let mut guard = state.lock();
        let Some(closed) = guard.prepare_close(Utc::now()) else {
            log::warn!(
                "[TRACKER] {}",
                StepwireError::StackUnderflow {
                    run_id: run_id.clone()
                }
            );
            return Ok(None);
        };

        if closed.emit {
            if let Err(e) = self.sink.offer(closed.record.clone(), run_id) {
                drop(guard);
                self.release_if_rejected(run_id);
                return Err(e);
            }
        } else {
            log::trace!(
                "[TRACKER] Run {} section '{}' closed unchanged, update suppressed",
                run_id,
                closed.record.name
            );
        }
        guard.commit_close(&closed.record);
        Ok(Some(closed.record))
    }

    /// Close all open sections, emit the finished run record and forget the run.
    pub fn end_run(&self, run_id: &RunId) -> Result<Record> {
        let Some((_, state)) = self.runs.remove(run_id) else {
            return Err(StepwireError::contract(run_id, "run is not being tracked"));
        };
        let mut state = state.lock();
        let emissions = state.finish(Utc::now());
        for record in emissions {
            self.sink.offer(record, run_id)?;
        }

        let run_record = state.run_record().clone();
        log::info!(
            "[TRACKER] Run {} finished with status {} ({} status update(s))",
            run_id,
            run_record.testing_status,
            state.statuses_observed()
        );
        Ok(run_record)
    }

    /// Current aggregate status of a tracked run
    pub fn run_status(&self, run_id: &RunId) -> Option<TestingStatus> {
        self.runs.get(run_id).map(|s| s.lock().aggregate())
    }

    /// Aggregate status of a compound, including compounds already closed
    pub fn compound_status(&self, run_id: &RunId, compound_id: &str) -> Option<TestingStatus> {
        self.runs
            .get(run_id)
            .and_then(|s| s.lock().compound_status(compound_id))
    }

    /// Number of sections currently open in a run
    pub fn depth(&self, run_id: &RunId) -> Option<usize> {
        self.runs.get(run_id).map(|s| s.lock().depth())
    }

    /// Forget a run without emitting anything. Returns true if it was tracked.
    pub fn discard(&self, run_id: &RunId) -> bool {
        self.runs.remove(run_id).is_some()
    }

    pub fn is_tracking(&self, run_id: &RunId) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn tracked_runs(&self) -> usize {
        self.runs.len()
    }

    fn state(&self, run_id: &RunId) -> Result<Arc<Mutex<RunState>>> {
        let state = self
            .runs
            .get(run_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| StepwireError::contract(run_id, "run is not being tracked"))?;
        if !self.sink.accepts(run_id) {
            self.release(run_id);
            return Err(StepwireError::contract(
                run_id,
                "run is no longer accepted for delivery",
            ));
        }
        Ok(state)
    }

    /// After a rejected offer, forget the run if its sink is gone for good.
    /// The run's lock must not be held.
    fn release_if_rejected(&self, run_id: &RunId) {
        if !self.sink.accepts(run_id) {
            self.release(run_id);
        }
    }

    fn release(&self, run_id: &RunId) {
        if self.runs.remove(run_id).is_some() {
            log::warn!(
                "[TRACKER] Run {} is no longer accepted for delivery, dropping its state",
                run_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use stepwire_types::{ExecutionStatus, RecordKind};

    /// Sink that keeps every offered record.
    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<Record>>,
    }

    impl CollectingSink {
        fn records(&self) -> Vec<Record> {
            self.records.lock().clone()
        }
    }

    impl RecordSink for CollectingSink {
        fn offer(&self, record: Record, _run_id: &RunId) -> Result<()> {
            self.records.lock().push(record);
            Ok(())
        }
    }

    /// Sink that refuses everything, like a stopped delivery queue.
    struct ClosedSink;

    impl RecordSink for ClosedSink {
        fn offer(&self, _record: Record, run_id: &RunId) -> Result<()> {
            Err(StepwireError::contract(run_id, "run is not active"))
        }
    }

    /// Sink that can be told to refuse offers, or to report the run as gone.
    #[derive(Default)]
    struct GatedSink {
        refusing: std::sync::atomic::AtomicBool,
        gone: std::sync::atomic::AtomicBool,
        offered: std::sync::atomic::AtomicUsize,
    }

    impl GatedSink {
        fn refuse(&self, refusing: bool) {
            self.refusing.store(refusing, std::sync::atomic::Ordering::SeqCst);
        }

        fn close(&self) {
            self.refuse(true);
            self.gone.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        fn offered(&self) -> usize {
            self.offered.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl RecordSink for GatedSink {
        fn offer(&self, _record: Record, run_id: &RunId) -> Result<()> {
            if self.refusing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StepwireError::contract(run_id, "run is not active"));
            }
            self.offered.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn accepts(&self, _run_id: &RunId) -> bool {
            !self.gone.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    fn tracker() -> (StepTracker, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        (StepTracker::new(sink.clone()), sink)
    }

    #[test]
    fn test_nested_warning_scenario() {
        let (tracker, sink) = tracker();
        let run = RunId::from("run-a");
        tracker.begin_run(&run).unwrap();

        let a = tracker.open_section(&run, SectionInput::new("A")).unwrap();
        tracker
            .open_section(&run, SectionInput::new("B").with_status(TestingStatus::Warning))
            .unwrap();
        let b = tracker.close_section(&run).unwrap().unwrap();
        assert_eq!(b.testing_status, TestingStatus::Warning);
        let a_closed = tracker.close_section(&run).unwrap().unwrap();

        assert_eq!(a_closed.id, a.id);
        assert_eq!(a_closed.testing_status, TestingStatus::Warning);
        assert_eq!(tracker.run_status(&run), Some(TestingStatus::Warning));

        let run_record = tracker.end_run(&run).unwrap();
        assert_eq!(run_record.testing_status, TestingStatus::Warning);

        // run, A, B, A update, final run record (B's close was unchanged)
        let records = sink.records();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["run-a", "A", "B", "A", "run-a"]);
        assert_eq!(records[3].revision, 1);
        assert_eq!(records[3].execution_status, ExecutionStatus::Finished);
    }

    #[test]
    fn test_close_on_empty_stack_is_noop() {
        let (tracker, sink) = tracker();
        let run = RunId::from("run-b");
        tracker.begin_run(&run).unwrap();

        assert!(tracker.close_section(&run).unwrap().is_none());
        assert_eq!(tracker.depth(&run), Some(0));
        assert_eq!(sink.records().len(), 1);

        // the run keeps going
        tracker.open_section(&run, SectionInput::new("after")).unwrap();
        assert_eq!(tracker.depth(&run), Some(1));
    }

    #[test]
    fn test_untracked_run_is_contract_violation() {
        let (tracker, _sink) = tracker();
        let run = RunId::from("never-started");

        let err = tracker
            .open_section(&run, SectionInput::new("x"))
            .unwrap_err();
        assert!(err.is_contract_violation());
        assert!(tracker.close_section(&run).unwrap_err().is_contract_violation());
        assert!(tracker.end_run(&run).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_begin_run_is_idempotent() {
        let (tracker, sink) = tracker();
        let run = RunId::from("run-c");

        let first = tracker.begin_run(&run).unwrap();
        let second = tracker.begin_run(&run).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, RecordKind::Run);
        assert_eq!(sink.records().len(), 1);
        assert_eq!(tracker.tracked_runs(), 1);
    }

    #[test]
    fn test_rejected_begin_leaves_no_state() {
        let tracker = StepTracker::new(Arc::new(ClosedSink));
        let run = RunId::from("run-d");

        assert!(tracker.begin_run(&run).unwrap_err().is_contract_violation());
        assert!(!tracker.is_tracking(&run));
    }

    #[test]
    fn test_end_run_forgets_state() {
        let (tracker, _sink) = tracker();
        let run = RunId::from("run-e");
        tracker.begin_run(&run).unwrap();
        tracker.open_section(&run, SectionInput::new("left open")).unwrap();

        let run_record = tracker.end_run(&run).unwrap();
        assert!(run_record.is_finished());
        assert!(!tracker.is_tracking(&run));
        assert!(
            tracker
                .report_leaf(&run, LeafInput::new("late"))
                .unwrap_err()
                .is_contract_violation()
        );
    }

    #[test]
    fn test_runs_are_isolated() {
        let (tracker, _sink) = tracker();
        let failing = RunId::from("failing");
        let passing = RunId::from("passing");
        tracker.begin_run(&failing).unwrap();
        tracker.begin_run(&passing).unwrap();

        tracker
            .report_leaf(&failing, LeafInput::new("boom").with_status(TestingStatus::Failed))
            .unwrap();
        tracker
            .report_leaf(&passing, LeafInput::new("ok").with_status(TestingStatus::Passed))
            .unwrap();

        assert_eq!(tracker.run_status(&failing), Some(TestingStatus::Failed));
        assert_eq!(tracker.run_status(&passing), Some(TestingStatus::Passed));
    }

    #[test]
    fn test_compound_status_query() {
        let (tracker, _sink) = tracker();
        let run = RunId::from("run-f");
        tracker.begin_run(&run).unwrap();

        let suite = tracker
            .open_section(&run, SectionInput::new("suite").compound())
            .unwrap();
        tracker
            .report_leaf(&run, LeafInput::new("flaky").with_status(TestingStatus::Warning))
            .unwrap();
        tracker.close_section(&run).unwrap();

        assert_eq!(
            tracker.compound_status(&run, &suite.id),
            Some(TestingStatus::Warning)
        );
        assert_eq!(tracker.compound_status(&run, "unknown"), None);
    }

    #[test]
    fn test_rejected_offer_leaves_run_state_unchanged() {
        let sink = Arc::new(GatedSink::default());
        let tracker = StepTracker::new(sink.clone());
        let run = RunId::from("run-g");
        tracker.begin_run(&run).unwrap();
        let suite = tracker
            .open_section(&run, SectionInput::new("suite").compound())
            .unwrap();

        sink.refuse(true);
        let open = tracker.open_section(
            &run,
            SectionInput::new("lost").with_status(TestingStatus::Failed),
        );
        assert!(open.unwrap_err().is_contract_violation());
        let leaf = tracker.report_leaf(
            &run,
            LeafInput::new("lost").with_status(TestingStatus::Stopped),
        );
        assert!(leaf.unwrap_err().is_contract_violation());

        // the sink still accepts the run, so only the rejected calls are undone
        assert!(tracker.is_tracking(&run));
        assert_eq!(tracker.depth(&run), Some(1));
        assert_eq!(tracker.run_status(&run), Some(TestingStatus::Unknown));
        assert_eq!(
            tracker.compound_status(&run, &suite.id),
            Some(TestingStatus::Unknown)
        );

        sink.refuse(false);
        tracker
            .report_leaf(&run, LeafInput::new("kept").with_status(TestingStatus::Warning))
            .unwrap();
        let closed = tracker.close_section(&run).unwrap().unwrap();
        assert_eq!(closed.id, suite.id);
        assert_eq!(closed.testing_status, TestingStatus::Warning);
        assert_eq!(tracker.depth(&run), Some(0));
    }

    #[test]
    fn test_rejected_close_keeps_section_open() {
        let sink = Arc::new(GatedSink::default());
        let tracker = StepTracker::new(sink.clone());
        let run = RunId::from("run-h");
        tracker.begin_run(&run).unwrap();
        tracker
            .open_section(&run, SectionInput::new("step").step())
            .unwrap();

        sink.refuse(true);
        assert!(tracker.close_section(&run).unwrap_err().is_contract_violation());
        assert_eq!(tracker.depth(&run), Some(1));

        sink.refuse(false);
        assert!(tracker.close_section(&run).unwrap().is_some());
        assert_eq!(tracker.depth(&run), Some(0));
    }

    #[test]
    fn test_run_dropped_once_sink_is_gone() {
        let sink = Arc::new(GatedSink::default());
        let tracker = StepTracker::new(sink.clone());
        let run = RunId::from("run-i");
        let other = RunId::from("run-j");
        tracker.begin_run(&run).unwrap();
        tracker.open_section(&run, SectionInput::new("open")).unwrap();
        let offered = sink.offered();

        sink.close();
        for _ in 0..2 {
            let err = tracker
                .open_section(&run, SectionInput::new("late"))
                .unwrap_err();
            assert!(err.is_contract_violation());
        }
        assert!(!tracker.is_tracking(&run));
        assert_eq!(tracker.depth(&run), None);
        assert_eq!(sink.offered(), offered);
        assert!(tracker.end_run(&run).unwrap_err().is_contract_violation());

        // a run the sink refuses from the start is never tracked
        assert!(tracker.begin_run(&other).unwrap_err().is_contract_violation());
        assert_eq!(tracker.tracked_runs(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open(TestingStatus),
        Leaf(TestingStatus),
        Close,
    }

    fn status_strategy() -> impl Strategy<Value = TestingStatus> {
        prop::sample::select(TestingStatus::ALL.to_vec())
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            status_strategy().prop_map(Op::Open),
            status_strategy().prop_map(Op::Leaf),
            Just(Op::Close),
        ]
    }

    proptest! {
        #[test]
        fn prop_well_nested_runs_keep_tree_invariants(
            ops in prop::collection::vec(op_strategy(), 1..60)
        ) {
            let (tracker, _sink) = tracker();
            let run = RunId::from("prop");
            tracker.begin_run(&run).unwrap();
            let root = tracker.open_section(&run, SectionInput::new("root")).unwrap();

            // Final state of every record by id, plus its parent
            let mut finals: std::collections::HashMap<String, Record> = Default::default();
            // Highest status ever assigned to each record
            let mut seen: std::collections::HashMap<String, u8> = Default::default();

            let mut depth = 1usize;
            for op in ops {
                match op {
                    Op::Open(status) => {
                        let record = tracker
                            .open_section(&run, SectionInput::new("s").with_status(status))
                            .unwrap();
                        seen.insert(record.id.clone(), status.rank());
                        depth += 1;
                    }
                    Op::Leaf(status) => {
                        let record = tracker
                            .report_leaf(&run, LeafInput::new("m").with_status(status))
                            .unwrap();
                        finals.insert(record.id.clone(), record);
                    }
                    Op::Close if depth > 1 => {
                        let record = tracker.close_section(&run).unwrap().unwrap();
                        let opened = seen.get(&record.id).copied().unwrap_or(0);
                        prop_assert!(record.testing_status.rank() >= opened);
                        finals.insert(record.id.clone(), record);
                        depth -= 1;
                    }
                    Op::Close => {}
                }
            }
            while depth > 0 {
                let record = tracker.close_section(&run).unwrap().unwrap();
                finals.insert(record.id.clone(), record);
                depth -= 1;
            }
            prop_assert_eq!(tracker.depth(&run), Some(0));
            prop_assert!(finals.contains_key(&root.id));

            for record in finals.values() {
                let (Some(start), Some(end)) = (record.started_at, record.ended_at) else {
                    prop_assert_eq!(record.duration_ms, None);
                    continue;
                };
                prop_assert_eq!(record.duration_ms, Some((end - start).num_milliseconds()));

                // walk every ancestor
                let mut parent = record.parent_id.clone();
                while let Some(pid) = parent {
                    let ancestor = &finals[&pid];
                    prop_assert!(ancestor.testing_status.rank() >= record.testing_status.rank());
                    parent = ancestor.parent_id.clone();
                }
            }

            let max_rank = finals.values().map(|r| r.testing_status.rank()).max().unwrap_or(0);
            prop_assert_eq!(tracker.run_status(&run).map(|s| s.rank()), Some(max_rank));
        }
    }
}
