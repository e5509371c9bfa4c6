//! LIFO of the sections currently open in one run.

use stepwire_types::{Record, TestingStatus};

/// A section that has been opened and not yet closed.
#[derive(Debug, Clone)]
pub struct OpenSection {
    /// Latest in-memory state of the section
    pub record: Record,
    /// Status the section was emitted with when it was opened
    pub opened_status: TestingStatus,
}

impl OpenSection {
    pub fn new(record: Record) -> Self {
        let opened_status = record.testing_status;
        Self {
            record,
            opened_status,
        }
    }

    /// True when the status moved since the opening record was emitted.
    pub fn status_changed(&self) -> bool {
        self.record.testing_status != self.opened_status
    }
}

#[derive(Debug, Default)]
pub struct SectionStack {
    sections: Vec<OpenSection>,
}

impl SectionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.sections.push(OpenSection::new(record));
    }

    /// Pop the innermost open section. None when nothing is open.
    pub fn pop(&mut self) -> Option<OpenSection> {
        self.sections.pop()
    }

    pub fn top(&self) -> Option<&OpenSection> {
        self.sections.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut OpenSection> {
        self.sections.last_mut()
    }

    /// Open section with the given id, searching from the top.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut OpenSection> {
        self.sections.iter_mut().rev().find(|s| s.record.id == id)
    }

    /// Id of the innermost open section
    pub fn top_id(&self) -> Option<&str> {
        self.top().map(|s| s.record.id.as_str())
    }

    /// Id of the innermost open section flagged as a compound.
    pub fn innermost_compound(&self) -> Option<&str> {
        self.sections
            .iter()
            .rev()
            .find(|s| s.record.compound)
            .map(|s| s.record.id.as_str())
    }

    pub fn depth(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
