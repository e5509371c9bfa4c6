//! Replay of recorded test events.
//!
//! A script is a JSON-lines file, one event per line, tagged by `op`:
//!
//! ```text
//! {"op": "start_run", "run_id": "nightly-42"}
//! {"op": "open_section", "run_id": "nightly-42", "name": "checkout", "compound": true}
//! {"op": "leaf", "run_id": "nightly-42", "name": "pay", "status": "passed"}
//! {"op": "close_section", "run_id": "nightly-42"}
//! {"op": "finish_run", "run_id": "nightly-42"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwire_types::{RunId, TestingStatus};
use thiserror::Error;

use crate::delivery::StopOutcome;
use crate::error::StepwireError;
use crate::records::{LeafInput, SectionInput};
use crate::reporter::Reporter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptEvent {
    StartRun {
        run_id: RunId,
    },
    OpenSection {
        run_id: RunId,
        name: String,
        #[serde(default)]
        status: Option<TestingStatus>,
        #[serde(default)]
        compound: bool,
        #[serde(default)]
        step: bool,
        #[serde(default)]
        payload: Value,
    },
    Leaf {
        run_id: RunId,
        name: String,
        #[serde(default)]
        status: Option<TestingStatus>,
        #[serde(default)]
        payload: Value,
    },
    CloseSection {
        run_id: RunId,
    },
    FinishRun {
        run_id: RunId,
    },
}

impl ScriptEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            ScriptEvent::StartRun { run_id }
            | ScriptEvent::OpenSection { run_id, .. }
            | ScriptEvent::Leaf { run_id, .. }
            | ScriptEvent::CloseSection { run_id }
            | ScriptEvent::FinishRun { run_id } => run_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("event {index}: {source}")]
    Replay {
        index: usize,
        #[source]
        source: StepwireError,
    },
}

/// Final state of one replayed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunVerdict {
    pub run_id: RunId,
    pub status: TestingStatus,
    pub delivery: StopOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    pub events_applied: usize,
    /// Verdicts in the order the runs finished
    pub runs: Vec<RunVerdict>,
}

impl ReplaySummary {
    pub fn verdict(&self, run_id: &RunId) -> Option<&RunVerdict> {
        self.runs.iter().find(|v| &v.run_id == run_id)
    }
}

pub fn load_script(path: &Path) -> Result<Vec<ScriptEvent>, ScriptError> {
    let content = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let events = parse_script(&content)?;
    log::info!("[REPLAY] Loaded {} event(s) from {}", events.len(), path.display());
    Ok(events)
}

pub fn parse_script(content: &str) -> Result<Vec<ScriptEvent>, ScriptError> {
    let mut events = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(line).map_err(|source| ScriptError::Parse {
            line: idx + 1,
            source,
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Drive `events` through `reporter` in order.
///
/// The first rejected event aborts the replay. Runs the script starts but
/// never finishes are finished once the events are exhausted.
pub fn replay(
    reporter: &Reporter,
    events: Vec<ScriptEvent>,
) -> Result<ReplaySummary, ScriptError> {
    let mut summary = ReplaySummary::default();
    let mut open_runs: Vec<RunId> = Vec::new();
    let mut seen: HashSet<RunId> = HashSet::new();

    for (index, event) in events.into_iter().enumerate() {
        let run_id = event.run_id().clone();
        let result = match event {
            ScriptEvent::StartRun { .. } => reporter.start_run(&run_id).map(|_| {
                if seen.insert(run_id.clone()) {
                    open_runs.push(run_id.clone());
                }
            }),
            ScriptEvent::OpenSection {
                name,
                status,
                compound,
                step,
                payload,
                ..
            } => {
                let mut input = SectionInput::new(name).with_payload(payload);
                if let Some(status) = status {
                    input = input.with_status(status);
                }
                if compound {
                    input = input.compound();
                }
                if step {
                    input = input.step();
                }
                reporter.open_section(&run_id, input).map(|_| ())
            }
            ScriptEvent::Leaf {
                name,
                status,
                payload,
                ..
            } => {
                let mut input = LeafInput::new(name).with_payload(payload);
                if let Some(status) = status {
                    input = input.with_status(status);
                }
                reporter.report_leaf(&run_id, input).map(|_| ())
            }
            ScriptEvent::CloseSection { .. } => reporter.close_section(&run_id).map(|_| ()),
            ScriptEvent::FinishRun { .. } => reporter.finish_run(&run_id).map(|outcome| {
                open_runs.retain(|r| r != &run_id);
                seen.remove(&run_id);
                summary.runs.push(RunVerdict {
                    run_id: run_id.clone(),
                    status: outcome.status(),
                    delivery: outcome.delivery,
                });
            }),
        };

        result.map_err(|source| ScriptError::Replay { index, source })?;
        summary.events_applied += 1;
    }

    for run_id in open_runs {
        log::warn!("[REPLAY] Run {} was never finished by the script, finishing it", run_id);
        let outcome = reporter
            .finish_run(&run_id)
            .map_err(|source| ScriptError::Replay {
                index: summary.events_applied,
                source,
            })?;
        summary.runs.push(RunVerdict {
            run_id,
            status: outcome.status(),
            delivery: outcome.delivery,
        });
    }

    Ok(summary)
}
