//! Configuration module
//!
//! Run configuration: the ordered pipeline list plus fork, aggregator and
//! cancellation tuning. Loaded once per run and immutable afterwards.

mod env;
mod file;

pub use env::{print_env_help, EnvBuilder, EnvConfig, EnvGuard};
pub use file::ConfigFile;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::policy::{SplitPolicy, SplitPolicyInstance};

/// Configuration for a whole run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Pipelines in evaluation order (first match wins)
    pub pipelines: Vec<PipelineConfig>,

    /// Abort the whole run when any pipeline aborts
    #[serde(default)]
    pub fail_fast: bool,

    /// Time in-flight units get to finish after cancellation
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Worker process management
    #[serde(default)]
    pub fork: ForkSettings,

    /// Result aggregation
    #[serde(default)]
    pub aggregator: AggregatorSettings,
}

fn default_grace_period_ms() -> u64 {
    5_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pipelines: vec![PipelineConfig::new("default", 4).with_policy(SplitPolicy::Single)],
            fail_fast: false,
            grace_period_ms: default_grace_period_ms(),
            fork: ForkSettings::default(),
            aggregator: AggregatorSettings::default(),
        }
    }
}

impl RunConfig {
    pub fn new(pipelines: Vec<PipelineConfig>) -> Self {
        Self {
            pipelines,
            ..Default::default()
        }
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_fork(mut self, fork: ForkSettings) -> Self {
        self.fork = fork;
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorSettings) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Validate the run configuration.
    ///
    /// Pipeline ids must be unique and non-empty, every pipeline needs at
    /// least one worker and one policy, and a catch-all pipeline may only
    /// appear last. The stall bound must be longer than the per-unit timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipelines.is_empty() {
            return Err(ConfigError::NoPipelines);
        }

        let mut seen = HashSet::new();
        for (position, pipeline) in self.pipelines.iter().enumerate() {
            if pipeline.id.trim().is_empty() {
                return Err(ConfigError::EmptyPipelineId(position));
            }
            if !seen.insert(pipeline.id.as_str()) {
                return Err(ConfigError::DuplicatePipelineId(pipeline.id.clone()));
            }
            pipeline.validate()?;
        }

        if let Some(position) = self
            .pipelines
            .iter()
            .position(PipelineConfig::is_catch_all)
        {
            if position + 1 < self.pipelines.len() {
                return Err(ConfigError::CatchAllNotLast {
                    catch_all: self.pipelines[position].id.clone(),
                    shadowed: self.pipelines[position + 1..]
                        .iter()
                        .map(|p| p.id.clone())
                        .collect(),
                });
            }
        }

        self.fork.validate()?;
        self.aggregator.validate()?;

        // A unit still inside its own timeout must not look like a stall.
        if let (Some(unit), Some(quiescence)) = (
            self.fork.unit_timeout_secs,
            self.aggregator.quiescence_timeout_secs,
        ) {
            if quiescence <= unit {
                return Err(ConfigError::InvalidSetting {
                    field: "aggregator.quiescence_timeout_secs",
                    reason: format!(
                        "must be greater than fork.unit_timeout_secs ({unit})"
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Configuration of one pipeline
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Unique id; position in the run config is the match order
    pub id: String,

    /// Number of worker processes
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How to launch a worker
    #[serde(default)]
    pub worker: WorkerEnvironment,

    /// Split policies; the pipeline takes a unit if any of them accepts it
    pub policies: Vec<SplitPolicy>,

    /// Backlog bound; `None` keeps the queue unbounded
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Log a warning once the backlog reaches this depth
    #[serde(default)]
    pub backlog_warning: Option<usize>,
}

fn default_workers() -> usize {
    1
}

impl PipelineConfig {
    pub fn new(id: impl Into<String>, workers: usize) -> Self {
        Self {
            id: id.into(),
            workers,
            worker: WorkerEnvironment::default(),
            policies: Vec::new(),
            queue_capacity: None,
            backlog_warning: None,
        }
    }

    pub fn with_policy(mut self, policy: SplitPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_worker(mut self, worker: WorkerEnvironment) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_backlog_warning(mut self, depth: usize) -> Self {
        self.backlog_warning = Some(depth);
        self
    }

    /// True when one of the policies accepts every unit
    pub fn is_catch_all(&self) -> bool {
        self.policies.iter().any(SplitPolicy::is_catch_all)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers(self.id.clone()));
        }
        if self.policies.is_empty() {
            return Err(ConfigError::NoPolicies(self.id.clone()));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::ZeroQueueCapacity(self.id.clone()));
        }
        for policy in &self.policies {
            policy.validate(&self.id)?;
        }
        // Compiling catches bad name patterns up front.
        SplitPolicyInstance::new(self).create_split_policy_matcher()?;
        Ok(())
    }
}

/// Worker launch description.
///
/// Opaque to the engine and the pipelines; only the worker launcher reads it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEnvironment {
    /// Worker executable
    #[serde(default)]
    pub program: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl WorkerEnvironment {
    pub fn command(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Worker process management settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkSettings {
    /// Start attempts after the first failure
    pub start_retries: u32,

    /// Initial backoff between start attempts (doubles per attempt)
    pub start_backoff_ms: u64,

    /// Backoff ceiling
    pub max_backoff_ms: u64,

    /// Crashes tolerated inside the window; one more aborts the pipeline
    pub crash_threshold: u32,

    /// Sliding window for crash counting
    pub crash_window_secs: u64,

    /// Liveness bound for a single unit; `None` waits forever
    pub unit_timeout_secs: Option<u64>,

    /// How long a stopping worker gets before it is killed
    pub shutdown_timeout_ms: u64,
}

impl Default for ForkSettings {
    fn default() -> Self {
        Self {
            start_retries: 3,
            start_backoff_ms: 200,
            max_backoff_ms: 5_000,
            crash_threshold: 5,
            crash_window_secs: 60,
            unit_timeout_secs: Some(600),
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl ForkSettings {
    pub fn start_backoff(&self) -> Duration {
        Duration::from_millis(self.start_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.crash_window_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "fork.crash_window_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.unit_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidSetting {
                field: "fork.unit_timeout_secs",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        if self.max_backoff_ms < self.start_backoff_ms {
            return Err(ConfigError::InvalidSetting {
                field: "fork.max_backoff_ms",
                reason: format!("must be at least start_backoff_ms ({})", self.start_backoff_ms),
            });
        }
        Ok(())
    }
}

/// Result aggregation settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// Stall bound: longest time without completion progress while units
    /// are outstanding. Must exceed `fork.unit_timeout_secs`. `None`
    /// disables stall detection.
    pub quiescence_timeout_secs: Option<u64>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            quiescence_timeout_secs: Some(900),
        }
    }
}

impl AggregatorSettings {
    pub fn quiescence_timeout(&self) -> Option<Duration> {
        self.quiescence_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.quiescence_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidSetting {
                field: "aggregator.quiescence_timeout_secs",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }
}
