//! Run orchestration
//!
//! The dispatcher wires source → split policy engine → pipelines →
//! aggregator and owns the run lifecycle: Idle → Running →
//! {Completed, Aborted}.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::aggregator::{ResultAggregator, RunEvent};
use super::cancel::CancelToken;
use super::pipeline::{Pipeline, PipelineQueue};
use super::worker::WorkerLauncher;
use crate::config::RunConfig;
use crate::error::{AbortReason, ConfigError};
use crate::models::{
    PipelineStatus, PipelineSummary, ResultRecord, RunProgress, RunStatus, RunSummary,
};
use crate::policy::{Route, SplitPolicyEngine};
use crate::source::TestUnitSource;
use crate::utils::timer::Timer;

/// Validated run setup; each [`Dispatcher::start`] is an independent run.
pub struct Dispatcher {
    config: Arc<RunConfig>,
    engine: Arc<SplitPolicyEngine>,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Dispatcher {
    /// Validate the configuration and compile the split policies.
    pub fn new(config: RunConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<Self, ConfigError> {
        config.validate()?;
        let engine = SplitPolicyEngine::from_pipelines(&config.pipelines)?;
        Ok(Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
            launcher,
        })
    }

    pub fn engine(&self) -> &SplitPolicyEngine {
        &self.engine
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Start a run on the current tokio runtime.
    pub fn start<S>(&self, source: S) -> RunHandle
    where
        S: TestUnitSource + 'static,
    {
        let cancel = CancelToken::new();
        let (progress_tx, progress) = watch::channel(RunProgress::default());
        let progress_tx = Arc::new(progress_tx);
        let (results_tx, results) = mpsc::unbounded_channel();

        let run = Run {
            config: self.config.clone(),
            engine: self.engine.clone(),
            launcher: self.launcher.clone(),
            cancel: cancel.clone(),
            progress: progress_tx,
            results: results_tx,
        };
        let task = tokio::spawn(run.execute(source));

        RunHandle {
            cancel,
            task,
            progress,
            results: Some(results),
        }
    }
}

/// Validate `config` and start a run over `source`.
pub fn start<S>(
    config: RunConfig,
    source: S,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<RunHandle, ConfigError>
where
    S: TestUnitSource + 'static,
{
    Ok(Dispatcher::new(config, launcher)?.start(source))
}

/// Control surface of a live run
pub struct RunHandle {
    cancel: CancelToken,
    task: JoinHandle<RunSummary>,
    progress: watch::Receiver<RunProgress>,
    results: Option<mpsc::UnboundedReceiver<ResultRecord>>,
}

impl RunHandle {
    /// Request cancellation; repeated calls have no further effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token for cancelling from another task, e.g. a signal handler
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Live progress snapshots
    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.clone()
    }

    /// Completion-ordered result stream. Available once.
    pub fn take_results(&mut self) -> Option<mpsc::UnboundedReceiver<ResultRecord>> {
        self.results.take()
    }

    /// Wait for the run to finish. Always yields a summary.
    pub async fn await_completion(self) -> RunSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Run task failed: {}", e);
                let mut summary = RunSummary::new(RunStatus::Aborted);
                summary.failure = Some(
                    self.cancel
                        .reason()
                        .cloned()
                        .unwrap_or(AbortReason::Cancelled),
                );
                summary
            }
        }
    }
}

/// State of one run, moved into the run task
struct Run {
    config: Arc<RunConfig>,
    engine: Arc<SplitPolicyEngine>,
    launcher: Arc<dyn WorkerLauncher>,
    cancel: CancelToken,
    progress: Arc<watch::Sender<RunProgress>>,
    results: mpsc::UnboundedSender<ResultRecord>,
}

impl Run {
    async fn execute<S: TestUnitSource>(self, mut source: S) -> RunSummary {
        let timer = Timer::start("run");
        self.progress.send_modify(|p| p.status = RunStatus::Running);
        info!(
            "Run started with {} pipelines (fail-fast: {})",
            self.config.pipelines.len(),
            self.config.fail_fast
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        let aggregator = ResultAggregator::new(
            events_rx,
            self.cancel.clone(),
            self.config.fail_fast,
            self.config.aggregator.quiescence_timeout(),
            self.progress.clone(),
            self.results.clone(),
        );
        let aggregator = tokio::spawn(aggregator.run());

        let mut queues = Vec::with_capacity(self.config.pipelines.len());
        let mut pipelines = Vec::with_capacity(self.config.pipelines.len());
        for config in &self.config.pipelines {
            let (queue, pipeline) = Pipeline::new(
                Arc::new(config.clone()),
                self.launcher.clone(),
                &self.config.fork,
                self.config.grace_period(),
                self.cancel.clone(),
                events.clone(),
            );
            queues.push(queue);
            pipelines.push(tokio::spawn(pipeline.run()));
        }

        self.feed(&mut source, &queues, &events).await;

        for queue in queues {
            queue.drain();
        }
        let pipeline_summaries = join_all(pipelines)
            .await
            .into_iter()
            .zip(&self.config.pipelines)
            .map(|(joined, config)| {
                joined.unwrap_or_else(|e| {
                    error!("Pipeline {} task failed: {}", config.id, e);
                    PipelineSummary {
                        id: config.id.clone(),
                        workers: config.workers,
                        assigned: 0,
                        status: PipelineStatus::Aborted,
                        crashes: 0,
                        restarts: 0,
                        start_failures: 0,
                    }
                })
            })
            .collect();
        drop(events);

        let mut summary = match aggregator.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Aggregator task failed: {}", e);
                RunSummary::new(RunStatus::Aborted)
            }
        };
        summary.pipelines = pipeline_summaries;
        summary.duration_ms = timer.elapsed_ms();
        summary.failure = self.cancel.reason().cloned();
        summary.status = if summary.failure.is_some() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        self.progress.send_modify(|p| p.status = summary.status);

        match &summary.failure {
            Some(reason) => warn!("Run aborted after {}ms: {}", summary.duration_ms, reason),
            None => info!(
                "Run completed in {}ms - Pass: {}/{} ({:.1}%)",
                summary.duration_ms,
                summary.passed,
                summary.submitted,
                summary.pass_rate()
            ),
        }
        timer.stop();
        summary
    }

    /// Pull units until the source is exhausted or the run is cancelled.
    async fn feed<S: TestUnitSource>(
        &self,
        source: &mut S,
        queues: &[PipelineQueue],
        events: &mpsc::UnboundedSender<RunEvent>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Run cancelled, no more units are pulled from the source");
                    return;
                }
                unit = source.next_unit() => unit,
            };
            let Some(unit) = next else {
                let _ = events.send(RunEvent::SourceExhausted);
                return;
            };

            let id = unit.id().clone();
            let _ = events.send(RunEvent::Submitted(id.clone()));

            match self.engine.assign(&unit) {
                Route::Unassigned => {
                    warn!("No split policy accepted {}", unit);
                    let _ = events.send(RunEvent::Record(ResultRecord::unassigned(id)));
                }
                Route::Pipeline(index) => {
                    let queue = &queues[index];
                    if let Err(unit) = queue.enqueue(unit, &self.cancel).await {
                        let _ = events.send(RunEvent::Record(ResultRecord::cancelled(
                            unit.id().clone(),
                            Some(queue.pipeline_id()),
                        )));
                    }
                }
            }
        }
    }
}
