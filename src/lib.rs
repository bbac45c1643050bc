//! pipesplit - split-policy test pipelines with forked worker pools
//!
//! Routes a stream of test units to pipelines by ordered split policies
//! (first match wins), runs each pipeline on its own pool of worker
//! processes, and aggregates exactly one result per unit into a run summary.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pipesplit::config::{PipelineConfig, RunConfig};
//! use pipesplit::executor::{start, ProcessLauncher};
//! use pipesplit::models::TestUnitDescriptor;
//! use pipesplit::policy::SplitPolicy;
//! use pipesplit::source::IterSource;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = RunConfig::new(vec![
//!     PipelineConfig::new("slow", 2).with_policy(SplitPolicy::CategoryMatch {
//!         categories: vec!["slow".to_string()],
//!     }),
//!     PipelineConfig::new("rest", 4).with_policy(SplitPolicy::Single),
//! ]);
//! let units = vec![TestUnitDescriptor::new("com.acme.OrderTest").with_tag("slow")];
//!
//! let launcher = Arc::new(ProcessLauncher::new(&config.fork));
//! let handle = start(config, IterSource::new(units), launcher)?;
//! let summary = handle.await_completion().await;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod policy;
pub mod source;
pub mod utils;
