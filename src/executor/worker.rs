//! Worker abstraction
//!
//! A worker is one isolated process that runs test units one at a time.
//! Pipelines only see the [`Worker`] trait; how a worker is started is the
//! launcher's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PipelineConfig;
use crate::error::WorkerFault;
use crate::models::{ExecutionOutcome, TestUnitDescriptor, UnitId};

/// What a worker reports for a unit it ran to completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub outcome: ExecutionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl UnitReport {
    pub fn passed() -> Self {
        Self {
            outcome: ExecutionOutcome::Passed,
            diagnostic: None,
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::Failed,
            diagnostic: Some(diagnostic.into()),
        }
    }

    pub fn error(diagnostic: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::Error,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// A live worker process
#[async_trait]
pub trait Worker: Send {
    /// Run one unit. Any `Err` means the worker can no longer be trusted
    /// and is treated as crashed.
    async fn execute(&mut self, unit: &TestUnitDescriptor) -> Result<UnitReport, WorkerFault>;

    /// Cheap liveness probe for an idle worker
    async fn is_alive(&mut self) -> bool;

    /// Ask the worker to exit; may wait for it
    async fn shutdown(&mut self);

    /// Terminate immediately
    async fn kill(&mut self);
}

/// Starts workers for a pipeline
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        pipeline: &PipelineConfig,
        worker_index: usize,
    ) -> Result<Box<dyn Worker>, WorkerFault>;
}

/// Lifecycle state of a worker slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Idle,
    Busy(UnitId),
    Crashed,
    Stopped,
}

impl WorkerState {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Idle | WorkerState::Busy(_)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Busy(unit) => write!(f, "busy({unit})"),
            WorkerState::Crashed => write!(f, "crashed"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_shape() {
        let report: UnitReport =
            serde_json::from_str(r#"{"outcome":"failed","diagnostic":"expected 2"}"#).unwrap();
        assert_eq!(report, UnitReport::failed("expected 2"));

        let json = serde_json::to_string(&UnitReport::passed()).unwrap();
        assert_eq!(json, r#"{"outcome":"passed"}"#);
    }

    #[test]
    fn test_worker_state_liveness() {
        assert!(WorkerState::Busy(UnitId::from("a.B")).is_live());
        assert!(WorkerState::Idle.is_live());
        assert!(!WorkerState::Crashed.is_live());
        assert!(!WorkerState::Stopped.is_live());
    }
}
