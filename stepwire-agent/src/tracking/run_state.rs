//! In-memory state of one run: open sections, compounds, and the run verdict.
//!
//! Every operation returns the records to emit; the caller hands them to the
//! delivery queue in the order returned.

use chrono::{DateTime, Utc};
use stepwire_types::{Record, RunId, TestingStatus};

use super::aggregator::StatusWatermark;
use super::compound::CompoundChain;
use super::stack::SectionStack;
use crate::records::{LeafInput, RecordFactory, SectionInput};

/// Outcome of closing a section.
#[derive(Debug, Clone)]
pub struct ClosedSection {
    /// Final state of the section
    pub record: Record,
    /// Whether an update record has to be sent for it
    pub emit: bool,
}

#[derive(Debug)]
pub struct RunState {
    run_id: RunId,
    factory: RecordFactory,
    stack: SectionStack,
    compounds: CompoundChain,
    aggregate: StatusWatermark,
    run_record: Record,
}

impl RunState {
    pub fn new(run_id: RunId, factory: RecordFactory, now: DateTime<Utc>) -> Self {
        let run_record = factory.run(&run_id, now);
        Self {
            run_id,
            factory,
            stack: SectionStack::new(),
            compounds: CompoundChain::new(),
            aggregate: StatusWatermark::new(),
            run_record,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// The backend run record as last emitted
    pub fn run_record(&self) -> &Record {
        &self.run_record
    }

    /// Highest status observed in this run so far.
    pub fn aggregate(&self) -> TestingStatus {
        self.aggregate.current()
    }

    /// Statuses folded into the aggregate so far
    pub fn statuses_observed(&self) -> u64 {
        self.aggregate.observed()
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn compound_status(&self, id: &str) -> Option<TestingStatus> {
        self.compounds.status(id)
    }

    /// Open a section and push it. Returns the record to emit.
    pub fn open_section(&mut self, input: SectionInput, now: DateTime<Utc>) -> Record {
        let record = self.prepare_section(input, now);
        self.commit_section(&record);
        record
    }

    /// Build the record for a new section without touching the run state.
    pub fn prepare_section(&self, input: SectionInput, now: DateTime<Utc>) -> Record {
        let record = self.factory.section(&self.run_id, input, now);
        self.attach(record)
    }

    /// Push a section built by [`RunState::prepare_section`] and propagate
    /// its opening status.
    pub fn commit_section(&mut self, record: &Record) {
        let status = record.testing_status;
        if record.compound {
            self.compounds
                .register(&record.id, record.compound_id.as_deref(), status);
        } else if let Some(origin) = record.compound_id.as_deref() {
            self.compounds.propagate(origin, status);
        }
        self.aggregate.observe(status);
        self.stack.push(record.clone());
    }

    /// Build a finished leaf and propagate its status. Returns the record to emit.
    pub fn report_leaf(&mut self, input: LeafInput, now: DateTime<Utc>) -> Record {
        let record = self.prepare_leaf(input, now);
        self.commit_leaf(&record);
        record
    }

    pub fn prepare_leaf(&self, input: LeafInput, now: DateTime<Utc>) -> Record {
        let record = self.factory.leaf(&self.run_id, input, now);
        self.attach(record)
    }

    pub fn commit_leaf(&mut self, record: &Record) {
        let status = record.testing_status;
        self.raise_open_parent(record.parent_id.as_deref(), status);
        if let Some(origin) = record.compound_id.as_deref() {
            self.compounds.propagate(origin, status);
        }
        self.aggregate.observe(status);
    }

    /// Pop and finish the innermost open section. None when nothing is open.
    pub fn close_section(&mut self, now: DateTime<Utc>) -> Option<ClosedSection> {
        let closed = self.prepare_close(now)?;
        self.commit_close(&closed.record);
        Some(closed)
    }

    /// Final state of the innermost open section if it were closed at `now`.
    /// The section stays open.
    pub fn prepare_close(&self, now: DateTime<Utc>) -> Option<ClosedSection> {
        let open = self.stack.top()?;
        let mut record = open.record.clone();
        record.finish(now);
        if record.compound {
            if let Some(node_status) = self.compounds.status(&record.id) {
                record.raise_status(node_status);
            }
        }

        let emit = record.testing_status != open.opened_status || record.step;
        if emit {
            record.revision += 1;
        }
        Some(ClosedSection { record, emit })
    }

    /// Pop the innermost section and propagate its final status.
    pub fn commit_close(&mut self, record: &Record) {
        if self.stack.pop().is_none() {
            return;
        }
        let status = record.testing_status;
        if record.compound {
            self.compounds.propagate(&record.id, status);
        } else if let Some(origin) = record.compound_id.as_deref() {
            self.compounds.propagate(origin, status);
        }
        self.raise_open_parent(record.parent_id.as_deref(), status);
        self.aggregate.observe(status);
    }

    /// Close whatever is still open, then finish the run record.
    ///
    /// Returns the records to emit, the finished run record last.
    pub fn finish(&mut self, now: DateTime<Utc>) -> Vec<Record> {
        let mut emissions = Vec::new();

        if !self.stack.is_empty() {
            log::warn!(
                "[TRACKER] Run {} finished with {} open section(s), closing them",
                self.run_id,
                self.stack.depth()
            );
        }
        while let Some(closed) = self.close_section(now) {
            if closed.emit {
                emissions.push(closed.record);
            }
        }

        let aggregate = self.aggregate.current();
        self.run_record.raise_status(aggregate);
        self.run_record.finish(now);
        self.run_record.revision += 1;
        emissions.push(self.run_record.clone());

        emissions
    }

    /// Default the parent to the stack top and the compound to the innermost
    /// open compound.
    fn attach(&self, mut record: Record) -> Record {
        if record.parent_id.is_none() {
            record.parent_id = self.stack.top_id().map(str::to_string);
        }
        if record.compound_id.is_none() {
            record.compound_id = self.stack.innermost_compound().map(str::to_string);
        }
        record
    }

    fn raise_open_parent(&mut self, parent_id: Option<&str>, status: TestingStatus) {
        let Some(parent_id) = parent_id else {
            return;
        };
        if let Some(parent) = self.stack.find_mut(parent_id) {
            parent.record.raise_status(status);
        }
    }
}
