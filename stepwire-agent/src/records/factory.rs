//! Builds records from caller input, filling ids, timestamps and lifecycle defaults.
//!
//! Parent and compound defaulting need the run's open sections, so the
//! tracker resolves those after the factory returns.

use chrono::{DateTime, Utc};
use stepwire_types::{ExecutionStatus, Record, RecordKind, RunId, TestingStatus};

use super::input::{LeafInput, SectionInput};

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFactory;

impl RecordFactory {
    pub fn new() -> Self {
        Self
    }

    /// The backend run record. Its id is the run id.
    pub fn run(&self, run_id: &RunId, now: DateTime<Utc>) -> Record {
        let mut record = Record::with_id(
            run_id.as_str(),
            run_id.clone(),
            RecordKind::Run,
            run_id.as_str(),
        );
        record.created_at = now;
        record.started_at = Some(now);
        record.execution_status = ExecutionStatus::InProgress;
        record
    }

    /// An opening section record.
    ///
    /// `started_at` stays empty for sections opened as `not_started`.
    pub fn section(&self, run_id: &RunId, input: SectionInput, now: DateTime<Utc>) -> Record {
        let mut record = self.base(run_id, RecordKind::Section, input.id, input.name);
        record.parent_id = input.parent_id;
        record.testing_status = input.status.unwrap_or_default();
        record.execution_status = ExecutionStatus::InProgress;
        record.created_at = now;
        if record.testing_status != TestingStatus::NotStarted {
            record.started_at = Some(now);
        }
        record.compound = input.compound;
        record.compound_id = input.compound_id;
        record.step = input.step;
        record.payload = input.payload;
        record
    }

    /// A finished leaf message.
    pub fn leaf(&self, run_id: &RunId, input: LeafInput, now: DateTime<Utc>) -> Record {
        let mut record = self.base(run_id, RecordKind::Message, input.id, input.name);
        record.parent_id = input.parent_id;
        record.testing_status = input.status.unwrap_or_default();
        record.created_at = now;
        let ended_at = input.ended_at.unwrap_or(now);
        record.started_at = Some(input.started_at.unwrap_or(ended_at));
        record.compound_id = input.compound_id;
        record.payload = input.payload;
        record.finish(ended_at);
        record
    }

    fn base(&self, run_id: &RunId, kind: RecordKind, id: Option<String>, name: String) -> Record {
        match id {
            Some(id) => Record::with_id(id, run_id.clone(), kind, name),
            None => Record::new(run_id.clone(), kind, name),
        }
    }
}
