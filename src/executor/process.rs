//! Process-backed workers
//!
//! Each worker is a child process speaking a line-delimited JSON protocol:
//! one `{"unit": <descriptor>}` request per line on stdin, one
//! `{"outcome": "passed|failed|error", "diagnostic": ...}` reply per line on
//! stdout. End of stdout or process exit while a unit is running counts as
//! a crash.

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::worker::{UnitReport, Worker, WorkerLauncher};
use crate::config::{ForkSettings, PipelineConfig};
use crate::error::WorkerFault;
use crate::models::TestUnitDescriptor;

/// Env var naming the pipeline a worker belongs to
pub const PIPELINE_ENV: &str = "PIPESPLIT_PIPELINE";
/// Env var carrying the worker's slot index within its pipeline
pub const WORKER_ENV: &str = "PIPESPLIT_WORKER";

#[derive(Serialize)]
struct Request<'a> {
    unit: &'a TestUnitDescriptor,
}

/// Launches workers from each pipeline's `worker` environment
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    shutdown_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(settings: &ForkSettings) -> Self {
        Self {
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(&ForkSettings::default())
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        pipeline: &PipelineConfig,
        worker_index: usize,
    ) -> Result<Box<dyn Worker>, WorkerFault> {
        let environment = &pipeline.worker;
        let program = environment.program.as_deref().ok_or_else(|| {
            WorkerFault::StartFailed(format!("pipeline '{}' has no worker program", pipeline.id))
        })?;

        let mut command = Command::new(program);
        command
            .args(&environment.args)
            .envs(&environment.env)
            .env(PIPELINE_ENV, &pipeline.id)
            .env(WORKER_ENV, worker_index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &environment.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| WorkerFault::StartFailed(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerFault::StartFailed("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerFault::StartFailed("worker stdout not captured".to_string()))?;

        debug!(
            "Started worker {}#{} (pid {:?})",
            pipeline.id,
            worker_index,
            child.id()
        );

        Ok(Box::new(ProcessWorker {
            label: format!("{}#{}", pipeline.id, worker_index),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            shutdown_timeout: self.shutdown_timeout,
        }))
    }
}

/// One worker child process
pub struct ProcessWorker {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    shutdown_timeout: Duration,
}

impl ProcessWorker {
    async fn exit_description(&mut self) -> String {
        match tokio::time::timeout(Duration::from_millis(500), self.child.wait()).await {
            Ok(Ok(status)) => format!("worker {} exited with {}", self.label, status),
            Ok(Err(e)) => format!("worker {} lost: {}", self.label, e),
            Err(_) => format!("worker {} closed its output", self.label),
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn execute(&mut self, unit: &TestUnitDescriptor) -> Result<UnitReport, WorkerFault> {
        let mut line = serde_json::to_string(&Request { unit })
            .map_err(|e| WorkerFault::Protocol(e.to_string()))?;
        line.push('\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerFault::Crashed(format!("worker {} is shut down", self.label)))?;
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!("Write to worker {} failed: {}", self.label, e);
            return Err(WorkerFault::Crashed(self.exit_description().await));
        }
        if let Err(e) = stdin.flush().await {
            debug!("Flush to worker {} failed: {}", self.label, e);
            return Err(WorkerFault::Crashed(self.exit_description().await));
        }

        match self.stdout.next_line().await {
            Ok(Some(reply)) => serde_json::from_str::<UnitReport>(reply.trim()).map_err(|e| {
                WorkerFault::Protocol(format!("unreadable reply from {}: {}", self.label, e))
            }),
            Ok(None) => Err(WorkerFault::Crashed(self.exit_description().await)),
            Err(e) => Err(WorkerFault::Crashed(format!(
                "read from worker {} failed: {}",
                self.label, e
            ))),
        }
    }

    async fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn shutdown(&mut self) {
        // Closing stdin is the exit request.
        drop(self.stdin.take());
        match tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Worker {} exited with {}", self.label, status),
            Ok(Err(e)) => warn!("Waiting for worker {} failed: {}", self.label, e),
            Err(_) => {
                warn!(
                    "Worker {} did not exit within {:?}, killing",
                    self.label, self.shutdown_timeout
                );
                self.kill().await;
            }
        }
    }

    async fn kill(&mut self) {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill().await {
            debug!("Kill of worker {} failed: {}", self.label, e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::WorkerEnvironment;
    use crate::models::ExecutionOutcome;

    fn shell_pipeline(script: &str) -> PipelineConfig {
        PipelineConfig::new("sh", 1)
            .with_worker(WorkerEnvironment::command("sh").arg("-c").arg(script))
    }

    fn launcher() -> ProcessLauncher {
        ProcessLauncher::new(&ForkSettings {
            shutdown_timeout_ms: 500,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_echo_worker_round_trip() {
        let pipeline = shell_pipeline(
            r#"while read line; do echo '{"outcome":"passed"}'; done"#,
        );
        let mut worker = launcher().launch(&pipeline, 0).await.unwrap();

        let unit = TestUnitDescriptor::new("com.acme.OrderTest");
        for _ in 0..3 {
            let report = worker.execute(&unit).await.unwrap();
            assert_eq!(report.outcome, ExecutionOutcome::Passed);
        }
        assert!(worker.is_alive().await);

        worker.shutdown().await;
        assert!(!worker.is_alive().await);
    }

    #[tokio::test]
    async fn test_worker_sees_pipeline_env() {
        let pipeline = shell_pipeline(
            r#"read line; echo "{\"outcome\":\"failed\",\"diagnostic\":\"$PIPESPLIT_PIPELINE/$PIPESPLIT_WORKER\"}""#,
        );
        let mut worker = launcher().launch(&pipeline, 3).await.unwrap();

        let report = worker
            .execute(&TestUnitDescriptor::new("a.B"))
            .await
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Failed);
        assert_eq!(report.diagnostic.as_deref(), Some("sh/3"));
        worker.kill().await;
    }

    #[tokio::test]
    async fn test_exit_mid_unit_is_crash() {
        let pipeline = shell_pipeline("read line; exit 3");
        let mut worker = launcher().launch(&pipeline, 0).await.unwrap();

        let fault = worker
            .execute(&TestUnitDescriptor::new("a.B"))
            .await
            .unwrap_err();
        assert!(matches!(fault, WorkerFault::Crashed(_)));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_protocol_fault() {
        let pipeline = shell_pipeline("while read line; do echo nonsense; done");
        let mut worker = launcher().launch(&pipeline, 0).await.unwrap();

        let fault = worker
            .execute(&TestUnitDescriptor::new("a.B"))
            .await
            .unwrap_err();
        assert!(matches!(fault, WorkerFault::Protocol(_)));
        worker.kill().await;
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let pipeline = PipelineConfig::new("none", 1);
        let err = launcher().launch(&pipeline, 0).await.err().unwrap();
        assert!(matches!(err, WorkerFault::StartFailed(_)));

        let pipeline = PipelineConfig::new("ghost", 1)
            .with_worker(WorkerEnvironment::command("/definitely/not/a/worker"));
        let err = launcher().launch(&pipeline, 0).await.err().unwrap();
        assert!(matches!(err, WorkerFault::StartFailed(_)));
    }
}
