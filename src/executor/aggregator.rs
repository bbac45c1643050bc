//! Result aggregation
//!
//! Single writer of the run tally. Every producer (the dispatcher and all
//! pipelines) sends [`RunEvent`]s into one channel; the aggregator keeps
//! exactly one terminal outcome per submitted unit and raises consistency
//! and stall faults through the run's cancel token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::cancel::CancelToken;
use crate::error::AbortReason;
use crate::models::{Outcome, ResultRecord, RunProgress, RunStatus, RunSummary, UnitId};

/// Messages into the aggregator
#[derive(Clone, Debug)]
pub enum RunEvent {
    /// A unit was pulled from the source
    Submitted(UnitId),
    /// Terminal record for a unit
    Record(ResultRecord),
    /// The source reported end of stream
    SourceExhausted,
    /// A pipeline exhausted its crash budget or could not start any worker
    PipelineAborted(String),
}

pub struct ResultAggregator {
    events: mpsc::UnboundedReceiver<RunEvent>,
    cancel: CancelToken,
    fail_fast: bool,
    quiescence: Option<Duration>,
    progress: Arc<watch::Sender<RunProgress>>,
    results: mpsc::UnboundedSender<ResultRecord>,
    outcomes: HashMap<UnitId, Option<Outcome>>,
    summary: RunSummary,
}

impl ResultAggregator {
    pub fn new(
        events: mpsc::UnboundedReceiver<RunEvent>,
        cancel: CancelToken,
        fail_fast: bool,
        quiescence: Option<Duration>,
        progress: Arc<watch::Sender<RunProgress>>,
        results: mpsc::UnboundedSender<ResultRecord>,
    ) -> Self {
        Self {
            events,
            cancel,
            fail_fast,
            quiescence,
            progress,
            results,
            outcomes: HashMap::new(),
            summary: RunSummary::new(RunStatus::Running),
        }
    }

    /// Consume events until every producer is gone, then return the tally.
    pub async fn run(mut self) -> RunSummary {
        let mut last_progress = Instant::now();
        let mut stalled = false;

        loop {
            let watchdog = self.quiescence.filter(|_| !stalled && self.outstanding() > 0);
            let deadline = last_progress + watchdog.unwrap_or_default();

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        let was_idle = self.outstanding() == 0;
                        if self.handle(event) || was_idle {
                            last_progress = Instant::now();
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if watchdog.is_some() => {
                    stalled = true;
                    let outstanding = self.outstanding();
                    let quiet = last_progress.elapsed();
                    error!(
                        "No result for {:?} with {} unit(s) outstanding, aborting run",
                        quiet, outstanding
                    );
                    self.cancel.cancel_with(AbortReason::StallFault {
                        outstanding,
                        quiet_secs: quiet.as_secs(),
                    });
                }
            }
        }

        self.finish();
        self.summary
    }

    /// Apply one event; returns `true` if a unit was accounted for.
    fn handle(&mut self, event: RunEvent) -> bool {
        match event {
            RunEvent::Submitted(unit) => {
                if self.outcomes.contains_key(&unit) {
                    self.fault(&unit, "unit submitted twice");
                    return false;
                }
                self.outcomes.insert(unit, None);
                self.summary.submitted += 1;
                self.progress.send_modify(|p| p.submitted += 1);
                false
            }
            RunEvent::Record(record) => self.accept(record),
            RunEvent::SourceExhausted => {
                debug!("Source exhausted after {} units", self.summary.submitted);
                self.progress.send_modify(|p| p.source_exhausted = true);
                false
            }
            RunEvent::PipelineAborted(pipeline) => {
                if self.fail_fast {
                    warn!("Pipeline {} aborted, fail-fast stops the run", pipeline);
                    self.cancel
                        .cancel_with(AbortReason::FailFast { pipeline });
                } else {
                    warn!("Pipeline {} aborted, other pipelines continue", pipeline);
                }
                false
            }
        }
    }

    fn accept(&mut self, record: ResultRecord) -> bool {
        match self.outcomes.get_mut(&record.unit) {
            None => {
                self.fault(&record.unit, "result for a unit that was never submitted");
                false
            }
            Some(Some(previous)) => {
                let detail = format!(
                    "duplicate result {} after {}",
                    record.outcome, previous
                );
                self.fault(&record.unit, &detail);
                false
            }
            Some(slot) => {
                *slot = Some(record.outcome);
                self.summary.count(record.outcome);
                self.progress.send_modify(|p| p.completed += 1);
                // The results stream is optional for callers.
                let _ = self.results.send(record);
                true
            }
        }
    }

    fn finish(&mut self) {
        let mut missing: Vec<&UnitId> = self
            .outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_none())
            .map(|(unit, _)| unit)
            .collect();
        if missing.is_empty() {
            return;
        }
        missing.sort();
        let unit = missing[0].to_string();
        let detail = format!("{} submitted unit(s) never reported", missing.len());
        error!("Consistency fault on {}: {}", unit, detail);
        self.cancel
            .cancel_with(AbortReason::ConsistencyFault { unit, detail });
    }

    fn fault(&self, unit: &UnitId, detail: &str) {
        error!("Consistency fault on {}: {}", unit, detail);
        self.cancel.cancel_with(AbortReason::ConsistencyFault {
            unit: unit.to_string(),
            detail: detail.to_string(),
        });
    }

    fn outstanding(&self) -> usize {
        self.summary.submitted - self.summary.accounted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        events: mpsc::UnboundedSender<RunEvent>,
        results: mpsc::UnboundedReceiver<ResultRecord>,
        progress: watch::Receiver<RunProgress>,
        cancel: CancelToken,
        aggregator: ResultAggregator,
    }

    fn fixture(fail_fast: bool, quiescence: Option<Duration>) -> Fixture {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (results_tx, results) = mpsc::unbounded_channel();
        let (progress_tx, progress) = watch::channel(RunProgress::default());
        let cancel = CancelToken::new();
        let aggregator = ResultAggregator::new(
            events_rx,
            cancel.clone(),
            fail_fast,
            quiescence,
            Arc::new(progress_tx),
            results_tx,
        );
        Fixture {
            events,
            results,
            progress,
            cancel,
            aggregator,
        }
    }

    fn submitted(name: &str) -> RunEvent {
        RunEvent::Submitted(UnitId::from(name))
    }

    fn record(name: &str, outcome: Outcome) -> RunEvent {
        RunEvent::Record(ResultRecord::new(
            UnitId::from(name),
            Some("p".to_string()),
            outcome,
        ))
    }

    #[tokio::test]
    async fn test_tally_and_progress() {
        let mut f = fixture(false, None);
        for event in [
            submitted("a.A"),
            submitted("a.B"),
            submitted("a.C"),
            record("a.A", Outcome::Passed),
            record("a.B", Outcome::Failed),
            RunEvent::Record(ResultRecord::unassigned(UnitId::from("a.C"))),
            RunEvent::SourceExhausted,
        ] {
            f.events.send(event).unwrap();
        }
        drop(f.events);

        let summary = f.aggregator.run().await;
        assert_eq!(summary.submitted, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unassigned, 1);
        assert!(summary.is_conserved());
        assert!(!f.cancel.is_cancelled());

        let progress = *f.progress.borrow();
        assert_eq!(progress.submitted, 3);
        assert_eq!(progress.completed, 3);
        assert!(progress.source_exhausted);

        let mut streamed = Vec::new();
        while let Ok(record) = f.results.try_recv() {
            streamed.push(record.unit.to_string());
        }
        assert_eq!(streamed, vec!["a.A", "a.B", "a.C"]);
    }

    #[tokio::test]
    async fn test_duplicate_record_is_consistency_fault() {
        let f = fixture(false, None);
        f.events.send(submitted("a.A")).unwrap();
        f.events.send(record("a.A", Outcome::Passed)).unwrap();
        f.events.send(record("a.A", Outcome::WorkerLost)).unwrap();
        drop(f.events);

        let summary = f.aggregator.run().await;
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.lost, 0);
        assert!(summary.is_conserved());
        assert!(matches!(
            f.cancel.reason(),
            Some(AbortReason::ConsistencyFault { unit, .. }) if unit == "a.A"
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_missing_units_are_faults() {
        let f = fixture(false, None);
        f.events.send(record("ghost", Outcome::Passed)).unwrap();
        drop(f.events);
        f.aggregator.run().await;
        assert!(matches!(
            f.cancel.reason(),
            Some(AbortReason::ConsistencyFault { unit, .. }) if unit == "ghost"
        ));

        let f = fixture(false, None);
        f.events.send(submitted("a.A")).unwrap();
        drop(f.events);
        let summary = f.aggregator.run().await;
        assert!(!summary.is_conserved());
        match f.cancel.reason() {
            Some(AbortReason::ConsistencyFault { unit, detail }) => {
                assert_eq!(unit, "a.A");
                assert!(detail.contains("never reported"));
            }
            other => panic!("expected consistency fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_fast_on_pipeline_abort() {
        let f = fixture(true, None);
        f.events
            .send(RunEvent::PipelineAborted("slow".to_string()))
            .unwrap();
        drop(f.events);
        f.aggregator.run().await;
        assert_eq!(
            f.cancel.reason(),
            Some(&AbortReason::FailFast {
                pipeline: "slow".to_string()
            })
        );

        let f = fixture(false, None);
        f.events
            .send(RunEvent::PipelineAborted("slow".to_string()))
            .unwrap();
        drop(f.events);
        f.aggregator.run().await;
        assert!(!f.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stall_fault() {
        let f = fixture(false, Some(Duration::from_millis(30)));
        let events = f.events;
        let cancel = f.cancel.clone();
        let task = tokio::spawn(f.aggregator.run());

        events.send(submitted("a.A")).unwrap();
        cancel.cancelled().await;
        assert!(matches!(
            cancel.reason(),
            Some(AbortReason::StallFault { outstanding: 1, .. })
        ));

        // The force-drain still lands in the tally.
        events.send(record("a.A", Outcome::Cancelled)).unwrap();
        drop(events);
        let summary = task.await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert!(summary.is_conserved());
    }

    #[tokio::test]
    async fn test_no_stall_while_idle() {
        let f = fixture(false, Some(Duration::from_millis(10)));
        let events = f.events;
        let cancel = f.cancel.clone();
        let task = tokio::spawn(f.aggregator.run());

        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(events);
        task.await.unwrap();
        assert!(!cancel.is_cancelled());
    }
}
