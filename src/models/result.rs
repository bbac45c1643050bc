//! Result models for pipeline runs
//!
//! Defines unit outcomes, result records and run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::unit::UnitId;
use crate::error::AbortReason;

/// Terminal outcome of a test unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Error,
    /// The unit's worker died or hung before reporting.
    WorkerLost,
    /// The run was cancelled before the unit finished.
    Cancelled,
    /// No split policy claimed the unit.
    Unassigned,
}

impl Outcome {
    pub fn symbol(&self) -> &'static str {
        match self {
            Outcome::Passed => "✓",
            Outcome::Failed => "✗",
            Outcome::Error => "!",
            Outcome::WorkerLost => "†",
            Outcome::Cancelled => "○",
            Outcome::Unassigned => "?",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASSED"),
            Outcome::Failed => write!(f, "FAILED"),
            Outcome::Error => write!(f, "ERROR"),
            Outcome::WorkerLost => write!(f, "WORKER-LOST"),
            Outcome::Cancelled => write!(f, "CANCELLED"),
            Outcome::Unassigned => write!(f, "UNASSIGNED"),
        }
    }
}

/// Outcome a worker may report for a unit it actually ran
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Passed,
    Failed,
    Error,
}

impl From<ExecutionOutcome> for Outcome {
    fn from(value: ExecutionOutcome) -> Self {
        match value {
            ExecutionOutcome::Passed => Outcome::Passed,
            ExecutionOutcome::Failed => Outcome::Failed,
            ExecutionOutcome::Error => Outcome::Error,
        }
    }
}

/// Terminal record for one test unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub unit: UnitId,
    /// Owning pipeline; `None` for unassigned units
    pub pipeline: Option<String>,
    pub outcome: Outcome,
    pub diagnostic: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(unit: UnitId, pipeline: Option<String>, outcome: Outcome) -> Self {
        Self {
            unit,
            pipeline,
            outcome,
            diagnostic: None,
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn worker_lost(unit: UnitId, pipeline: &str, diagnostic: impl Into<String>) -> Self {
        Self::new(unit, Some(pipeline.to_string()), Outcome::WorkerLost).with_diagnostic(diagnostic)
    }

    pub fn cancelled(unit: UnitId, pipeline: Option<&str>) -> Self {
        Self::new(unit, pipeline.map(str::to_string), Outcome::Cancelled)
    }

    pub fn unassigned(unit: UnitId) -> Self {
        Self::new(unit, None, Outcome::Unassigned)
            .with_diagnostic("no split policy accepted this unit")
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}ms]",
            self.outcome.symbol(),
            self.pipeline.as_deref().unwrap_or("-"),
            self.unit,
            self.duration_ms
        )?;
        if let Some(diagnostic) = &self.diagnostic {
            write!(f, " - {diagnostic}")?;
        }
        Ok(())
    }
}

/// Lifecycle status of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Final status of one pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Completed,
    /// Finished, but ran with fewer live workers than configured.
    Degraded,
    /// Crash budget exhausted or no worker could be started.
    Aborted,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Completed => write!(f, "completed"),
            PipelineStatus::Degraded => write!(f, "degraded"),
            PipelineStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Per-pipeline section of a run summary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: String,
    pub workers: usize,
    pub assigned: usize,
    pub status: PipelineStatus,
    pub crashes: u32,
    pub restarts: u32,
    pub start_failures: u32,
}

/// Progress snapshot published while a run is live
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub status: RunStatus,
    pub submitted: usize,
    pub completed: usize,
    pub source_exhausted: bool,
}

impl RunProgress {
    pub fn outstanding(&self) -> usize {
        self.submitted.saturating_sub(self.completed)
    }
}

/// Final summary of a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub submitted: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub lost: usize,
    pub cancelled: usize,
    pub unassigned: usize,
    /// Set only when the run itself aborted
    pub failure: Option<AbortReason>,
    pub duration_ms: u64,
    pub pipelines: Vec<PipelineSummary>,
}

impl RunSummary {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            submitted: 0,
            passed: 0,
            failed: 0,
            errored: 0,
            lost: 0,
            cancelled: 0,
            unassigned: 0,
            failure: None,
            duration_ms: 0,
            pipelines: Vec::new(),
        }
    }

    pub fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Error => self.errored += 1,
            Outcome::WorkerLost => self.lost += 1,
            Outcome::Cancelled => self.cancelled += 1,
            Outcome::Unassigned => self.unassigned += 1,
        }
    }

    pub fn accounted(&self) -> usize {
        self.passed + self.failed + self.errored + self.lost + self.cancelled + self.unassigned
    }

    /// `submitted == passed + failed + errored + lost + cancelled + unassigned`
    pub fn is_conserved(&self) -> bool {
        self.submitted == self.accounted()
    }

    /// Completed with every unit passing.
    pub fn is_all_passed(&self) -> bool {
        self.status == RunStatus::Completed && self.passed == self.submitted
    }

    pub fn pass_rate(&self) -> f64 {
        if self.submitted == 0 {
            0.0
        } else {
            (self.passed as f64 / self.submitted as f64) * 100.0
        }
    }

    pub fn pipeline(&self, id: &str) -> Option<&PipelineSummary> {
        self.pipelines.iter().find(|p| p.id == id)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.status)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for pipeline in &self.pipelines {
            writeln!(
                f,
                "  {:16} {:>6} units  {:2} workers  {} (crashes: {}, restarts: {})",
                pipeline.id,
                pipeline.assigned,
                pipeline.workers,
                pipeline.status,
                pipeline.crashes,
                pipeline.restarts
            )?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Submitted: {} | Pass: {} | Fail: {} | Error: {} | Lost: {} | Cancelled: {} | Unassigned: {}",
            self.submitted,
            self.passed,
            self.failed,
            self.errored,
            self.lost,
            self.cancelled,
            self.unassigned
        )?;
        write!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.duration_ms
        )?;
        if let Some(reason) = &self.failure {
            write!(f, "\nAborted: {reason}")?;
        }
        Ok(())
    }
}
