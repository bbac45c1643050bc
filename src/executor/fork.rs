//! Fork manager
//!
//! Owns the worker slots of one pipeline: starts workers with retry and
//! backoff, probes idle workers before handing them out, and restarts
//! crashed workers until the crash budget for the sliding window runs out.

use futures::future::join_all;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::worker::{Worker, WorkerLauncher, WorkerState};
use crate::config::{ForkSettings, PipelineConfig};
use crate::error::WorkerFault;
use crate::models::UnitId;

/// Crash timestamps inside the sliding window
#[derive(Debug)]
struct CrashHistory {
    window: Duration,
    threshold: u32,
    crashes: VecDeque<Instant>,
}

impl CrashHistory {
    fn new(settings: &ForkSettings) -> Self {
        Self {
            window: settings.crash_window(),
            threshold: settings.crash_threshold,
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash; returns `true` once the window holds more crashes
    /// than the threshold allows.
    fn record(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.crashes.front() {
            if now.duration_since(*oldest) > self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);
        self.crashes.len() > self.threshold as usize
    }

    fn recent(&self) -> usize {
        self.crashes.len()
    }
}

struct Slot {
    state: WorkerState,
    worker: Option<Box<dyn Worker>>,
}

/// Everything needed to start a worker, shareable across concurrent starts
struct Starter {
    pipeline: Arc<PipelineConfig>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: ForkSettings,
    cancel: CancelToken,
}

impl Starter {
    async fn start(&self, index: usize) -> Result<Box<dyn Worker>, WorkerFault> {
        let attempts = self.settings.start_retries + 1;
        let mut backoff = self.settings.start_backoff();

        for attempt in 1..=attempts {
            let fault = match self.launcher.launch(&self.pipeline, index).await {
                Ok(worker) => return Ok(worker),
                Err(fault) => fault,
            };
            if attempt == attempts {
                return Err(fault);
            }

            let delay = jittered(backoff);
            debug!(
                "Pipeline {}: start of worker {} failed (attempt {}/{}), retrying in {:?}: {}",
                self.pipeline.id, index, attempt, attempts, delay, fault
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(WorkerFault::StartFailed("cancelled during start backoff".to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(self.settings.max_backoff());
        }

        Err(WorkerFault::StartFailed("no start attempts configured".to_string()))
    }
}

/// Worker pool of one pipeline
pub struct ForkManager {
    pipeline: Arc<PipelineConfig>,
    settings: ForkSettings,
    cancel: CancelToken,
    starter: Starter,
    slots: Vec<Slot>,
    history: CrashHistory,
    crashes: u32,
    restarts: u32,
    start_failures: u32,
    aborted: bool,
}

impl ForkManager {
    pub fn new(
        pipeline: Arc<PipelineConfig>,
        launcher: Arc<dyn WorkerLauncher>,
        settings: ForkSettings,
        cancel: CancelToken,
    ) -> Self {
        let slots = (0..pipeline.workers)
            .map(|_| Slot {
                state: WorkerState::Starting,
                worker: None,
            })
            .collect();
        Self {
            history: CrashHistory::new(&settings),
            starter: Starter {
                pipeline: pipeline.clone(),
                launcher,
                settings: settings.clone(),
                cancel: cancel.clone(),
            },
            pipeline,
            settings,
            cancel,
            slots,
            crashes: 0,
            restarts: 0,
            start_failures: 0,
            aborted: false,
        }
    }

    /// Start every slot concurrently. Slots that exhaust their retries stay
    /// stopped and the pipeline runs degraded.
    pub async fn start_all(&mut self) -> usize {
        let starter = &self.starter;
        let results = join_all((0..self.slots.len()).map(|index| starter.start(index))).await;

        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(worker) => {
                    self.slots[index] = Slot {
                        state: WorkerState::Idle,
                        worker: Some(worker),
                    };
                }
                Err(fault) => {
                    self.start_failures += 1;
                    self.slots[index].state = WorkerState::Stopped;
                    warn!(
                        "Pipeline {}: worker {} could not be started: {}",
                        self.pipeline.id, index, fault
                    );
                }
            }
        }

        let live = self.live_workers();
        if live == 0 {
            error!("Pipeline {}: no worker could be started", self.pipeline.id);
            self.aborted = true;
        } else if live < self.slots.len() {
            warn!(
                "Pipeline {} degraded: {}/{} workers running",
                self.pipeline.id,
                live,
                self.slots.len()
            );
        } else {
            info!("Pipeline {}: {} workers started", self.pipeline.id, live);
        }
        live
    }

    /// Hand out an idle worker for `unit`, probing it first. Dead idle
    /// workers are handled as crashes.
    pub async fn acquire(&mut self, unit: &UnitId) -> Option<(usize, Box<dyn Worker>)> {
        while !self.aborted {
            let index = self
                .slots
                .iter()
                .position(|slot| slot.state == WorkerState::Idle && slot.worker.is_some())?;
            let mut worker = self.slots[index].worker.take()?;

            if worker.is_alive().await {
                self.slots[index].state = WorkerState::Busy(unit.clone());
                return Some((index, worker));
            }

            self.on_crash(index, Some(worker), "worker died while idle").await;
        }
        None
    }

    /// Return a worker that finished its unit normally
    pub fn release(&mut self, index: usize, worker: Box<dyn Worker>) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.state = WorkerState::Idle;
            slot.worker = Some(worker);
        }
    }

    /// Handle a crashed worker: kill it, count the crash and restart the
    /// slot unless the crash budget is exhausted.
    pub async fn on_crash(&mut self, index: usize, worker: Option<Box<dyn Worker>>, detail: &str) {
        if let Some(mut worker) = worker {
            worker.kill().await;
        }
        self.crashes += 1;
        self.slots[index].state = WorkerState::Crashed;
        warn!(
            "Pipeline {}: worker {} crashed: {}",
            self.pipeline.id, index, detail
        );

        if self.history.record(Instant::now()) {
            error!(
                "Pipeline {}: {} crashes within {:?}, aborting",
                self.pipeline.id,
                self.history.recent(),
                self.settings.crash_window()
            );
            self.aborted = true;
            return;
        }
        if self.cancel.is_cancelled() {
            self.slots[index].state = WorkerState::Stopped;
            return;
        }

        match self.starter.start(index).await {
            Ok(worker) => {
                self.restarts += 1;
                self.slots[index] = Slot {
                    state: WorkerState::Idle,
                    worker: Some(worker),
                };
                debug!("Pipeline {}: worker {} restarted", self.pipeline.id, index);
            }
            Err(fault) => {
                self.start_failures += 1;
                self.slots[index].state = WorkerState::Stopped;
                warn!(
                    "Pipeline {}: worker {} could not be restarted: {}",
                    self.pipeline.id, index, fault
                );
                if self.live_workers() == 0 {
                    error!("Pipeline {}: no live workers left", self.pipeline.id);
                    self.aborted = true;
                }
            }
        }
    }

    /// Mark a busy slot whose task was force-terminated
    pub fn abandon(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.state = WorkerState::Stopped;
        }
    }

    /// Ask every worker to exit and wait for them
    pub async fn shutdown_all(&mut self) {
        let mut workers: Vec<Box<dyn Worker>> = Vec::new();
        for slot in &mut self.slots {
            if let Some(worker) = slot.worker.take() {
                workers.push(worker);
            }
            slot.state = WorkerState::Stopped;
        }
        join_all(workers.iter_mut().map(|worker| worker.shutdown())).await;
        debug!(
            "Pipeline {}: {} workers shut down",
            self.pipeline.id,
            workers.len()
        );
    }

    pub fn has_idle(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.state == WorkerState::Idle && slot.worker.is_some())
    }

    pub fn live_workers(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.is_live()).count()
    }

    pub fn state(&self, index: usize) -> Option<&WorkerState> {
        self.slots.get(index).map(|slot| &slot.state)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Ran with fewer workers than configured at some point
    pub fn is_degraded(&self) -> bool {
        self.start_failures > 0
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn start_failures(&self) -> u32 {
        self.start_failures
    }
}

/// Backoff plus up to 25% random jitter
fn jittered(backoff: Duration) -> Duration {
    let spread = backoff.as_millis() as u64 / 4;
    if spread == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::rng().random_range(0..=spread))
}
