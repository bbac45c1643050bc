//! Scripted in-memory workers for executor tests

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::worker::{UnitReport, Worker, WorkerLauncher};
use crate::config::PipelineConfig;
use crate::error::WorkerFault;
use crate::models::TestUnitDescriptor;

#[derive(Debug, Default)]
struct Script {
    crash_on: HashSet<String>,
    fail_on: HashSet<String>,
    error_on: HashSet<String>,
    hang_on: HashSet<String>,
    panic_on: HashSet<String>,
    dead_pipelines: HashSet<String>,
    delay: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
    kills: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

/// Launcher whose workers follow a per-unit-name script
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    script: Arc<Script>,
    fail_starts: usize,
    counters: Arc<Counters>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&mut self) -> &mut Script {
        Arc::get_mut(&mut self.script).expect("script is configured before launching")
    }

    /// Worker exits while running this unit
    pub fn crash_on(mut self, unit: &str) -> Self {
        self.script_mut().crash_on.insert(unit.to_string());
        self
    }

    pub fn fail_on(mut self, unit: &str) -> Self {
        self.script_mut().fail_on.insert(unit.to_string());
        self
    }

    pub fn error_on(mut self, unit: &str) -> Self {
        self.script_mut().error_on.insert(unit.to_string());
        self
    }

    /// Worker never answers for this unit
    pub fn hang_on(mut self, unit: &str) -> Self {
        self.script_mut().hang_on.insert(unit.to_string());
        self
    }

    pub fn panic_on(mut self, unit: &str) -> Self {
        self.script_mut().panic_on.insert(unit.to_string());
        self
    }

    /// Every start for this pipeline fails
    pub fn dead_pipeline(mut self, pipeline: &str) -> Self {
        self.script_mut().dead_pipelines.insert(pipeline.to_string());
        self
    }

    /// Time every unit takes
    pub fn delay(mut self, delay: Duration) -> Self {
        self.script_mut().delay = delay;
        self
    }

    /// The first `count` launches fail
    pub fn fail_starts(mut self, count: usize) -> Self {
        self.fail_starts = count;
        self
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.counters.kills.load(Ordering::SeqCst)
    }

    /// Names of units a worker actually started, in start order
    pub fn executed(&self) -> Vec<String> {
        self.counters.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        pipeline: &PipelineConfig,
        _worker_index: usize,
    ) -> Result<Box<dyn Worker>, WorkerFault> {
        let attempt = self.counters.launches.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_starts || self.script.dead_pipelines.contains(&pipeline.id) {
            return Err(WorkerFault::StartFailed(format!(
                "scripted start failure #{attempt}"
            )));
        }
        Ok(Box::new(ScriptedWorker {
            script: self.script.clone(),
            counters: self.counters.clone(),
            alive: true,
        }))
    }
}

struct ScriptedWorker {
    script: Arc<Script>,
    counters: Arc<Counters>,
    alive: bool,
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn execute(&mut self, unit: &TestUnitDescriptor) -> Result<UnitReport, WorkerFault> {
        let name = unit.name().to_string();
        self.counters.executed.lock().unwrap().push(name.clone());

        if !self.script.delay.is_zero() {
            tokio::time::sleep(self.script.delay).await;
        }
        if self.script.hang_on.contains(&name) {
            std::future::pending::<()>().await;
        }
        if self.script.panic_on.contains(&name) {
            panic!("scripted panic in {name}");
        }
        if self.script.crash_on.contains(&name) {
            self.alive = false;
            return Err(WorkerFault::Crashed(format!("scripted crash in {name}")));
        }
        if self.script.fail_on.contains(&name) {
            return Ok(UnitReport::failed(format!("{name} failed")));
        }
        if self.script.error_on.contains(&name) {
            return Ok(UnitReport::error(format!("{name} errored")));
        }
        Ok(UnitReport::passed())
    }

    async fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn shutdown(&mut self) {
        self.alive = false;
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn kill(&mut self) {
        self.alive = false;
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
    }
}
