//! Error types
//!
//! Typed failures for configuration, workers and run aborts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Fatal: a run with a bad config never starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no pipelines configured")]
    NoPipelines,

    #[error("pipeline id must not be empty (position {0})")]
    EmptyPipelineId(usize),

    #[error("duplicate pipeline id: {0}")]
    DuplicatePipelineId(String),

    #[error("pipeline '{0}' has zero workers")]
    ZeroWorkers(String),

    #[error("pipeline '{0}' has no split policy")]
    NoPolicies(String),

    #[error("catch-all pipeline '{catch_all}' must be last; it shadows {shadowed:?}")]
    CatchAllNotLast {
        catch_all: String,
        shadowed: Vec<String>,
    },

    #[error("pipeline '{pipeline}': invalid name pattern '{pattern}': {reason}")]
    InvalidPattern {
        pipeline: String,
        pattern: String,
        reason: String,
    },

    #[error("pipeline '{pipeline}': {reason}")]
    InvalidPolicy { pipeline: String, reason: String },

    #[error("pipeline '{0}' has a zero queue capacity")]
    ZeroQueueCapacity(String),

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// Faults raised by a single worker while starting or running a unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerFault {
    #[error("worker failed to start: {0}")]
    StartFailed(String),

    #[error("worker crashed: {0}")]
    Crashed(String),

    #[error("worker unresponsive after {0:?}")]
    Unresponsive(Duration),

    #[error("worker protocol error: {0}")]
    Protocol(String),
}

/// Why a whole run was aborted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// External cancellation through the run handle.
    Cancelled,
    /// A pipeline aborted while fail-fast was configured.
    FailFast { pipeline: String },
    /// A duplicate or impossible result record arrived.
    ConsistencyFault { unit: String, detail: String },
    /// No completion progress within the quiescence window.
    StallFault { outstanding: usize, quiet_secs: u64 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "run cancelled"),
            AbortReason::FailFast { pipeline } => {
                write!(f, "fail-fast: pipeline '{pipeline}' aborted")
            }
            AbortReason::ConsistencyFault { unit, detail } => {
                write!(f, "consistency fault on unit '{unit}': {detail}")
            }
            AbortReason::StallFault {
                outstanding,
                quiet_secs,
            } => write!(
                f,
                "stall fault: {outstanding} unit(s) outstanding with no progress for {quiet_secs}s"
            ),
        }
    }
}
