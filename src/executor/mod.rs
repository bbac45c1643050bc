//! Test execution engine
//!
//! Pipelines with forked worker pools, result aggregation and the run
//! dispatcher tying them together.

mod aggregator;
mod cancel;
mod dispatcher;
mod fork;
mod pipeline;
mod process;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{ResultAggregator, RunEvent};
pub use cancel::CancelToken;
pub use dispatcher::{start, Dispatcher, RunHandle};
pub use fork::ForkManager;
pub use pipeline::{Pipeline, PipelineQueue};
pub use process::{ProcessLauncher, ProcessWorker, PIPELINE_ENV, WORKER_ENV};
pub use worker::{UnitReport, Worker, WorkerLauncher, WorkerState};
