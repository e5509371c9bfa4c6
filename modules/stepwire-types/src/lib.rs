//! Shared types for the stepwire agent and the backends that ingest its records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =====================================================
// Identifiers
// =====================================================

/// Identifier of one test run. Every record and every delivery queue is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random run id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =====================================================
// Statuses
// =====================================================

/// Verdict of a test step.
///
/// The variants carry an explicit severity rank:
///
/// | status        | rank |
/// |---------------|------|
/// | `Unknown`     | 0    |
/// | `NotStarted`  | 1    |
/// | `Passed`      | 2    |
/// | `Warning`     | 3    |
/// | `Failed`      | 4    |
/// | `Stopped`     | 5    |
///
/// Aggregation always keeps the higher rank, so a parent can only get worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestingStatus {
    #[default]
    Unknown,
    NotStarted,
    Passed,
    Warning,
    Failed,
    Stopped,
}

impl TestingStatus {
    /// All statuses, lowest rank first.
    pub const ALL: [TestingStatus; 6] = [
        TestingStatus::Unknown,
        TestingStatus::NotStarted,
        TestingStatus::Passed,
        TestingStatus::Warning,
        TestingStatus::Failed,
        TestingStatus::Stopped,
    ];

    /// Severity rank. Spelled out per variant rather than derived from declaration order.
    pub fn rank(self) -> u8 {
        match self {
            TestingStatus::Unknown => 0,
            TestingStatus::NotStarted => 1,
            TestingStatus::Passed => 2,
            TestingStatus::Warning => 3,
            TestingStatus::Failed => 4,
            TestingStatus::Stopped => 5,
        }
    }

    /// The higher-ranked of the two statuses.
    pub fn merge(self, other: TestingStatus) -> TestingStatus {
        if other.rank() > self.rank() { other } else { self }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestingStatus::Unknown => "unknown",
            TestingStatus::NotStarted => "not_started",
            TestingStatus::Passed => "passed",
            TestingStatus::Warning => "warning",
            TestingStatus::Failed => "failed",
            TestingStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TestingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a record, independent of its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    NotStarted,
    InProgress,
    Finished,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Finished)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::NotStarted => write!(f, "not_started"),
            ExecutionStatus::InProgress => write!(f, "in_progress"),
            ExecutionStatus::Finished => write!(f, "finished"),
        }
    }
}

/// What a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The backend run record; its id is the run id
    Run,
    /// A section that can contain nested children
    Section,
    /// A leaf message (log line, assertion, attachment)
    Message,
}

// =====================================================
// Records
// =====================================================

/// One unit of telemetry as it travels to the backend.
///
/// A record handed to a delivery queue is never mutated again. Later changes to
/// the same logical record are sent as a new record with the same `id` and a
/// higher `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique record identifier
    pub id: String,
    /// Enclosing section (None for roots)
    pub parent_id: Option<String>,
    /// The run this record belongs to
    pub run_id: RunId,
    pub kind: RecordKind,
    /// Human-readable name (step title, message text)
    pub name: String,
    /// Verdict; only ever raised, never lowered
    pub testing_status: TestingStatus,
    pub execution_status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `ended_at - started_at` in milliseconds, set once both are known
    pub duration_ms: Option<i64>,
    /// Compound this record reports its status into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compound_id: Option<String>,
    /// This section is itself a compound
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compound: bool,
    /// This section is a step boundary; its close is always reported
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub step: bool,
    /// 0 for the first emission, incremented for each partial update
    #[serde(default)]
    pub revision: u32,
    /// Opaque caller data
    #[serde(default)]
    pub payload: Value,
}

impl Record {
    /// Create a not-yet-started record with a fresh id.
    pub fn new(run_id: RunId, kind: RecordKind, name: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), run_id, kind, name)
    }

    /// Create a not-yet-started record with a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        run_id: RunId,
        kind: RecordKind,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            run_id,
            kind,
            name: name.into(),
            testing_status: TestingStatus::Unknown,
            execution_status: ExecutionStatus::NotStarted,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            compound_id: None,
            compound: false,
            step: false,
            revision: 0,
            payload: Value::Null,
        }
    }

    /// Raise the testing status to `incoming` if it ranks higher.
    ///
    /// Returns true when the status changed.
    pub fn raise_status(&mut self, incoming: TestingStatus) -> bool {
        let merged = self.testing_status.merge(incoming);
        let changed = merged != self.testing_status;
        self.testing_status = merged;
        changed
    }

    /// Mark the record finished at `at` unless an end time is already set,
    /// and compute the duration when the start is known.
    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.execution_status = ExecutionStatus::Finished;
        let ended = *self.ended_at.get_or_insert(at);
        if self.duration_ms.is_none() {
            self.duration_ms = self
                .started_at
                .map(|start| (ended - start).num_milliseconds());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.execution_status.is_terminal()
    }
}
