//! Pipeline dispatch
//!
//! A pipeline owns a FIFO work queue and a [`ForkManager`]. Its dispatch
//! loop pairs idle workers with queued units, records one result per unit
//! and keeps going through worker crashes until the queue is drained.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::aggregator::RunEvent;
use super::cancel::CancelToken;
use super::fork::ForkManager;
use super::worker::{UnitReport, Worker, WorkerLauncher};
use crate::config::{ForkSettings, PipelineConfig};
use crate::error::WorkerFault;
use crate::models::{
    Outcome, PipelineStatus, PipelineSummary, ResultRecord, TestUnitDescriptor, UnitId,
};

enum QueueSender {
    Bounded(mpsc::Sender<TestUnitDescriptor>),
    Unbounded(mpsc::UnboundedSender<TestUnitDescriptor>),
}

enum QueueReceiver {
    Bounded(mpsc::Receiver<TestUnitDescriptor>),
    Unbounded(mpsc::UnboundedReceiver<TestUnitDescriptor>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<TestUnitDescriptor> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Producer side of a pipeline's work queue
pub struct PipelineQueue {
    id: String,
    tx: QueueSender,
    depth: Arc<AtomicUsize>,
    backlog_warning: Option<usize>,
    warned: AtomicBool,
}

impl PipelineQueue {
    pub fn pipeline_id(&self) -> &str {
        &self.id
    }

    /// Units waiting in the queue
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Add a unit to the queue.
    ///
    /// Never waits on an unbounded queue. A bounded queue waits for space
    /// until the run is cancelled. On failure the unit is handed back.
    pub async fn enqueue(
        &self,
        unit: TestUnitDescriptor,
        cancel: &CancelToken,
    ) -> Result<(), TestUnitDescriptor> {
        if cancel.is_cancelled() {
            return Err(unit);
        }

        self.depth.fetch_add(1, Ordering::SeqCst);
        let sent = match &self.tx {
            QueueSender::Unbounded(tx) => tx.send(unit).map_err(|e| e.0),
            QueueSender::Bounded(tx) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(unit),
                    permit = tx.reserve() => match permit {
                        Ok(permit) => {
                            permit.send(unit);
                            Ok(())
                        }
                        Err(_) => Err(unit),
                    },
                }
            }
        };

        match sent {
            Ok(()) => {
                self.check_backlog();
                Ok(())
            }
            Err(unit) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Err(unit)
            }
        }
    }

    /// Warn once each time the backlog climbs to the limit; the warning
    /// re-arms after the queue falls below it. Returns `true` when it warned.
    fn check_backlog(&self) -> bool {
        let Some(limit) = self.backlog_warning else {
            return false;
        };
        let depth = self.depth();
        if depth < limit {
            self.warned.store(false, Ordering::SeqCst);
            return false;
        }
        if self.warned.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!(
            "Pipeline {} backlog reached {} queued units",
            self.id, depth
        );
        true
    }

    /// No more units will arrive; the pipeline finishes what it has.
    pub fn drain(self) {
        debug!(
            "Draining pipeline {} with {} queued units",
            self.id,
            self.depth()
        );
    }
}

/// Output of one unit execution task
struct Completion {
    slot: usize,
    unit: UnitId,
    worker: Box<dyn Worker>,
    result: Result<UnitReport, WorkerFault>,
    elapsed_ms: u64,
}

/// One execution lane: queue, worker pool and dispatch loop
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    fork: ForkManager,
    rx: QueueReceiver,
    depth: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<RunEvent>,
    cancel: CancelToken,
    grace: Duration,
    unit_timeout: Option<Duration>,
    received: usize,
    abort_reported: bool,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        launcher: Arc<dyn WorkerLauncher>,
        settings: &ForkSettings,
        grace: Duration,
        cancel: CancelToken,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> (PipelineQueue, Self) {
        let (tx, rx) = match config.queue_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
        };
        let depth = Arc::new(AtomicUsize::new(0));

        let queue = PipelineQueue {
            id: config.id.clone(),
            tx,
            depth: depth.clone(),
            backlog_warning: config.backlog_warning,
            warned: AtomicBool::new(false),
        };
        let pipeline = Self {
            fork: ForkManager::new(config.clone(), launcher, settings.clone(), cancel.clone()),
            config,
            rx,
            depth,
            events,
            cancel,
            grace,
            unit_timeout: settings.unit_timeout(),
            received: 0,
            abort_reported: false,
        };
        (queue, pipeline)
    }

    /// Start the workers, run the dispatch loop until the queue is drained,
    /// then stop the workers.
    pub async fn run(mut self) -> PipelineSummary {
        info!(
            "Starting pipeline {} with {} workers",
            self.config.id, self.config.workers
        );
        self.fork.start_all().await;
        self.dispatch_loop().await;
        self.fork.shutdown_all().await;

        let status = if self.fork.is_aborted() {
            PipelineStatus::Aborted
        } else if self.fork.is_degraded() {
            PipelineStatus::Degraded
        } else {
            PipelineStatus::Completed
        };
        info!(
            "Pipeline {} {}: {} units, {} crashes, {} restarts",
            self.config.id,
            status,
            self.received,
            self.fork.crashes(),
            self.fork.restarts()
        );

        PipelineSummary {
            id: self.config.id.clone(),
            workers: self.config.workers,
            assigned: self.received,
            status,
            crashes: self.fork.crashes(),
            restarts: self.fork.restarts(),
            start_failures: self.fork.start_failures(),
        }
    }

    async fn dispatch_loop(&mut self) {
        let mut tasks: JoinSet<Completion> = JoinSet::new();
        let mut busy: HashMap<usize, UnitId> = HashMap::new();
        let mut held: Option<TestUnitDescriptor> = None;
        let mut queue_open = true;
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        loop {
            self.report_abort();

            if let Some(unit) = held.take() {
                held = self.place(unit, &mut tasks, &mut busy).await;
            }
            if held.is_some() && tasks.is_empty() && !self.fork.has_idle() {
                if let Some(unit) = held.take() {
                    error!(
                        "Pipeline {}: no worker available for {}",
                        self.config.id,
                        unit.id()
                    );
                    self.emit(ResultRecord::worker_lost(
                        unit.id().clone(),
                        &self.config.id,
                        "no worker available",
                    ));
                }
            }
            if held.is_none() && !queue_open && tasks.is_empty() {
                break;
            }

            let deadline = grace_deadline.unwrap_or_else(tokio::time::Instant::now);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if grace_deadline.is_none() => {
                    info!(
                        "Pipeline {} cancelled, {} units in flight",
                        self.config.id,
                        tasks.len()
                    );
                    grace_deadline = Some(tokio::time::Instant::now() + self.grace);
                }
                _ = tokio::time::sleep_until(deadline), if grace_deadline.is_some() && !tasks.is_empty() => {
                    self.terminate(&mut tasks, &mut busy).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok(done) => self.complete(done, &mut busy).await,
                    Err(e) => error!("Pipeline {}: unit task failed: {}", self.config.id, e),
                },
                unit = self.rx.recv(), if queue_open && held.is_none() => match unit {
                    Some(unit) => {
                        self.depth.fetch_sub(1, Ordering::SeqCst);
                        self.received += 1;
                        held = Some(unit);
                    }
                    None => {
                        debug!("Pipeline {} queue closed", self.config.id);
                        queue_open = false;
                    }
                },
            }
        }
    }

    /// Dispatch a unit, or settle it when the pipeline cannot run it.
    /// Returns the unit if it must wait for a worker.
    async fn place(
        &mut self,
        unit: TestUnitDescriptor,
        tasks: &mut JoinSet<Completion>,
        busy: &mut HashMap<usize, UnitId>,
    ) -> Option<TestUnitDescriptor> {
        if self.cancel.is_cancelled() {
            self.emit(ResultRecord::cancelled(
                unit.id().clone(),
                Some(&self.config.id),
            ));
            return None;
        }

        if !self.fork.is_aborted() && self.fork.has_idle() {
            if let Some((slot, worker)) = self.fork.acquire(unit.id()).await {
                debug!(
                    "Pipeline {}: dispatching {} to worker {}",
                    self.config.id,
                    unit.id(),
                    slot
                );
                busy.insert(slot, unit.id().clone());
                tasks.spawn(execute_unit(slot, worker, unit, self.unit_timeout));
                return None;
            }
        }

        if self.fork.is_aborted() {
            self.emit(ResultRecord::worker_lost(
                unit.id().clone(),
                &self.config.id,
                "pipeline aborted",
            ));
            return None;
        }
        Some(unit)
    }

    async fn complete(&mut self, done: Completion, busy: &mut HashMap<usize, UnitId>) {
        busy.remove(&done.slot);
        match done.result {
            Ok(report) => {
                let mut record = ResultRecord::new(
                    done.unit,
                    Some(self.config.id.clone()),
                    Outcome::from(report.outcome),
                )
                .with_duration_ms(done.elapsed_ms);
                record.diagnostic = report.diagnostic;
                self.emit(record);
                self.fork.release(done.slot, done.worker);
            }
            Err(fault) => {
                let detail = fault.to_string();
                self.emit(
                    ResultRecord::worker_lost(done.unit, &self.config.id, detail.as_str())
                        .with_duration_ms(done.elapsed_ms),
                );
                self.fork
                    .on_crash(done.slot, Some(done.worker), &detail)
                    .await;
            }
        }
    }

    /// Grace period is over: stop every in-flight unit. Units that finish
    /// while stopping keep their real outcome.
    async fn terminate(
        &mut self,
        tasks: &mut JoinSet<Completion>,
        busy: &mut HashMap<usize, UnitId>,
    ) {
        warn!(
            "Pipeline {}: grace period over, terminating {} units",
            self.config.id,
            tasks.len()
        );
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(done) = joined {
                self.complete(done, busy).await;
            }
        }
        for (slot, unit) in busy.drain() {
            self.fork.abandon(slot);
            self.emit(
                ResultRecord::cancelled(unit, Some(&self.config.id))
                    .with_diagnostic("terminated after grace period"),
            );
        }
    }

    fn report_abort(&mut self) {
        if self.fork.is_aborted() && !self.abort_reported {
            self.abort_reported = true;
            warn!(
                "Pipeline {} aborted; remaining units are reported as worker-lost",
                self.config.id
            );
            let _ = self
                .events
                .send(RunEvent::PipelineAborted(self.config.id.clone()));
        }
    }

    fn emit(&self, record: ResultRecord) {
        debug!("{}", record);
        if self.events.send(RunEvent::Record(record)).is_err() {
            debug!("Pipeline {}: aggregator gone", self.config.id);
        }
    }
}

async fn execute_unit(
    slot: usize,
    mut worker: Box<dyn Worker>,
    unit: TestUnitDescriptor,
    timeout: Option<Duration>,
) -> Completion {
    let started = Instant::now();
    let run = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, worker.execute(&unit))
                .await
                .unwrap_or(Err(WorkerFault::Unresponsive(limit))),
            None => worker.execute(&unit).await,
        }
    };
    let result = match AssertUnwindSafe(run).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(WorkerFault::Crashed(panic_message(payload))),
    };

    Completion {
        slot,
        unit: unit.id().clone(),
        worker,
        result,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}
