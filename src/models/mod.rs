//! Data models for pipeline runs
//!
//! Test unit descriptors, result records and run summaries.

mod result;
mod unit;

pub use result::{
    ExecutionOutcome, Outcome, PipelineStatus, PipelineSummary, ResultRecord, RunProgress,
    RunStatus, RunSummary,
};
pub use unit::{TestUnitDescriptor, UnitId};
