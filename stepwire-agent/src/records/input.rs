//! Caller-facing input for the section lifecycle calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwire_types::TestingStatus;

/// Input for opening a section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionInput {
    pub name: String,
    /// Caller-chosen id; a UUID is generated when absent
    #[serde(default)]
    pub id: Option<String>,
    /// Defaults to the innermost open section
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Defaults to `unknown`
    #[serde(default)]
    pub status: Option<TestingStatus>,
    /// Track this section as a compound
    #[serde(default)]
    pub compound: bool,
    /// Compound to report into; defaults to the innermost open compound
    #[serde(default)]
    pub compound_id: Option<String>,
    /// Always report the close of this section
    #[serde(default)]
    pub step: bool,
    #[serde(default)]
    pub payload: Value,
}

impl SectionInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_status(mut self, status: TestingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_compound_id(mut self, compound_id: impl Into<String>) -> Self {
        self.compound_id = Some(compound_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Mark the section as a compound.
    pub fn compound(mut self) -> Self {
        self.compound = true;
        self
    }

    /// Mark the section as a step boundary.
    pub fn step(mut self) -> Self {
        self.step = true;
        self
    }
}

/// Input for reporting a leaf message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeafInput {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    /// Defaults to the innermost open section
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub status: Option<TestingStatus>,
    /// Compound to report into; defaults to the innermost open compound
    #[serde(default)]
    pub compound_id: Option<String>,
    /// Defaults to `ended_at`
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Defaults to the time of the report
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Value,
}

impl LeafInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_status(mut self, status: TestingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_compound_id(mut self, compound_id: impl Into<String>) -> Self {
        self.compound_id = Some(compound_id.into());
        self
    }

    pub fn with_timing(mut self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}
