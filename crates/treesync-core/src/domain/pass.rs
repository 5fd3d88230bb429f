//! SyncPass domain entity
//!
//! A [`SyncPass`] is one run of analysis (and, unless analysis-only, execution)
//! for a source/destination pair. It records timing, the analysis summary, the
//! executed descriptors and the terminal [`PassOutcome`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::analysis::AnalysisSummary;
use super::change::{ChangeDescriptor, ProcessingState};
use super::newtypes::{PassId, RelativePath};

/// Whether a pass applies the changes it finds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    #[default]
    Execute,
    AnalyzeOnly,
}

/// Terminal result of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    /// Every change was applied
    Success,
    /// Changes were applied but some items were skipped or an analysis failed
    Warning,
    /// At least one descriptor failed, or analysis failed with nothing applied
    Error,
    /// There was nothing to synchronize
    NotRun,
    /// A cancellation was observed before completion
    Cancelled,
}

impl PassOutcome {
    /// Returns the outcome name as a string slice
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::NotRun => "not_run",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the change-tracking cursor may be committed after this outcome
    pub fn allows_cursor_commit(&self) -> bool {
        matches!(self, Self::Success | Self::Warning | Self::NotRun)
    }
}

impl std::fmt::Display for PassOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Stage of a running pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStage {
    Analyzing,
    Executing,
    Committing,
    Finished,
}

/// Progress notification published while a pass runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageChanged {
        stage: PassStage,
    },
    ItemStarted {
        path: RelativePath,
    },
    ItemCompleted {
        path: RelativePath,
        succeeded: bool,
        bytes_completed: u64,
        files_completed: u64,
        throughput_bytes_per_sec: f64,
    },
}

/// One analysis/execution run over a source/destination pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPass {
    id: PassId,
    mode: PassMode,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Option<PassOutcome>,
    analysis: AnalysisSummary,
    descriptors: Vec<ChangeDescriptor>,
    bytes_transferred: u64,
    files_completed: u64,
}

impl SyncPass {
    /// Start a new pass now
    pub fn new(mode: PassMode) -> Self {
        Self {
            id: PassId::new(),
            mode,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            analysis: AnalysisSummary::default(),
            descriptors: Vec::new(),
            bytes_transferred: 0,
            files_completed: 0,
        }
    }

    pub fn id(&self) -> PassId {
        self.id
    }

    pub fn mode(&self) -> PassMode {
        self.mode
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn outcome(&self) -> Option<PassOutcome> {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn analysis(&self) -> &AnalysisSummary {
        &self.analysis
    }

    pub fn descriptors(&self) -> &[ChangeDescriptor] {
        &self.descriptors
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn files_completed(&self) -> u64 {
        self.files_completed
    }

    /// Descriptors that ended in [`ProcessingState::Failed`], with their messages
    pub fn failed_descriptors(&self) -> impl Iterator<Item = &ChangeDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.state() == ProcessingState::Failed)
    }

    /// Elapsed time, up to now while running
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }

    pub fn set_analysis(&mut self, analysis: AnalysisSummary) {
        self.analysis = analysis;
    }

    /// Record the executed descriptors and transfer totals
    pub fn record_execution(
        &mut self,
        descriptors: Vec<ChangeDescriptor>,
        bytes_transferred: u64,
        files_completed: u64,
    ) {
        self.descriptors = descriptors;
        self.bytes_transferred = bytes_transferred;
        self.files_completed = files_completed;
    }

    /// Mark the pass finished with `outcome`
    pub fn finish(&mut self, outcome: PassOutcome) {
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }
}
