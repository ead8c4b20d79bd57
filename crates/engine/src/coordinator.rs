//! Schedule coordinator
//!
//! Drives one epoch at a time: compute the deadline, start the worker, wait
//! for the deadline or the worker running dry, halt it, publish what it made,
//! then fold the result back into the pool.

use crate::{
    error::{EngineError, Result},
    publisher::{self, PublishReport},
    schedule::{time_until, EpochSchedule},
    worker::{EpochMode, PipelineState, PrecomputeWorker, WorkerConfig, WorkerEvent},
    DEFAULT_EPOCH_SECS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Epoch length in seconds
    pub epoch_secs: u64,
    /// Stop after this many epochs (0 = run forever)
    pub max_epochs: u64,
    /// Publish at the deadline even when the worker finished early
    pub hold_until_deadline: bool,
    /// Cap on blocks published per epoch
    pub publish_limit: Option<u64>,
    pub worker: WorkerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            epoch_secs: DEFAULT_EPOCH_SECS,
            max_epochs: 0,
            hold_until_deadline: false,
            publish_limit: None,
            worker: WorkerConfig::default(),
        }
    }
}

/// Result of one epoch
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: u64,
    pub mode: EpochMode,
    pub deadline: DateTime<Utc>,
    pub produced: u64,
    /// The deadline cut production short
    pub halted: bool,
    pub published: u64,
    pub elapsed: Duration,
    /// Published blocks per second
    pub tps: f64,
}

/// Events sent to subscribers
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// An epoch started and will publish at `deadline`
    Scheduled {
        epoch: u64,
        mode: EpochMode,
        deadline: DateTime<Utc>,
    },
    /// An epoch finished publishing
    Published(EpochSummary),
}

/// Runs the precompute/publish cycle
pub struct ScheduleCoordinator {
    config: CoordinatorConfig,
    schedule: EpochSchedule,
    events: broadcast::Sender<CoordinatorEvent>,
    /// Set to true to stop before the next epoch
    shutdown: Option<watch::Receiver<bool>>,
    epoch: u64,
    /// Deadline of the previous epoch; the next one is always later
    last_deadline: Option<DateTime<Utc>>,
}

impl ScheduleCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            schedule: EpochSchedule::from_secs(config.epoch_secs),
            config,
            events,
            shutdown: None,
            epoch: 0,
            last_deadline: None,
        }
    }

    /// Stop before the next epoch once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Subscribe to epoch events
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Run epochs until `max_epochs` is reached, returning the final state
    pub async fn run(mut self, mut state: PipelineState) -> Result<PipelineState> {
        tracing::info!(
            "Coordinator started ({}s epochs, {} accounts)",
            self.config.epoch_secs,
            state.pool.len()
        );

        while self.config.max_epochs == 0 || self.epoch < self.config.max_epochs {
            if self.stopping() {
                tracing::info!("Shutdown requested");
                break;
            }
            let (next, summary) = self.run_epoch(state).await?;
            state = next;

            tracing::info!(
                "Epoch {} ({}): published {}/{} blocks, Average Transactions per Second: {:.2}",
                summary.epoch,
                summary.mode,
                summary.published,
                summary.produced,
                summary.tps
            );
            let _ = self.events.send(CoordinatorEvent::Published(summary));
            self.epoch += 1;
        }

        tracing::info!("Coordinator finished after {} epochs", self.epoch);
        Ok(state)
    }

    /// Run a single epoch
    pub async fn run_epoch(
        &mut self,
        mut state: PipelineState,
    ) -> Result<(PipelineState, EpochSummary)> {
        let epoch = self.epoch;
        let mode = EpochMode::for_epoch(epoch);
        let now = Utc::now();
        let from = self.last_deadline.map_or(now, |last| last.max(now));
        let deadline = self.schedule.next_deadline(from);
        self.last_deadline = Some(deadline);

        tracing::info!(
            "Epoch {} ({}) scheduled for {}",
            epoch,
            mode,
            deadline.with_timezone(&chrono::Local).to_rfc2822()
        );
        let _ = self.events.send(CoordinatorEvent::Scheduled {
            epoch,
            mode,
            deadline,
        });

        state.begin_epoch();
        let limit = match mode {
            EpochMode::Send => None,
            EpochMode::Receive => Some(state.sends_published),
        };

        let mut worker = PrecomputeWorker::spawn(
            state,
            self.config.worker.clone(),
            mode,
            limit,
            Some(deadline),
        );

        let (produced, halted) = tokio::select! {
            _ = tokio::time::sleep(time_until(deadline, Utc::now())) => {
                tracing::info!("Scheduled time reached");
                (worker.halt().await?, true)
            }
            event = worker.next_event() => match event {
                Some(WorkerEvent::Exhausted(count)) => (Some(count), false),
                Some(other) => {
                    return Err(EngineError::HandshakeViolation(format!(
                        "unexpected {:?} before halt",
                        other
                    )));
                }
                None => (None, false),
            }
        };

        let mut state = worker.join().await?;
        let produced = produced.ok_or_else(|| {
            EngineError::HandshakeViolation("worker stopped without reporting a count".to_string())
        })?;

        if self.config.hold_until_deadline {
            let wait = time_until(deadline, Utc::now());
            if !wait.is_zero() {
                tracing::info!("Holding {} blocks until the deadline ({:?})", produced, wait);
                tokio::time::sleep(wait).await;
            }
        }

        let max = match (self.config.publish_limit, limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let report: PublishReport =
            publisher::publish(state.pool.ledger().as_ref(), &state.buffer, produced, max).await?;

        state.finish_epoch(mode, &report);
        if mode == EpochMode::Receive {
            let swept = state.pool.sweep_pending().await?;
            if swept > 0 {
                tracing::info!("Claimed {} leftover sends", swept);
            }
        }

        let summary = EpochSummary {
            epoch,
            mode,
            deadline,
            produced,
            halted,
            published: report.published,
            elapsed: report.elapsed,
            tps: report.tps,
        };
        Ok((state, summary))
    }
}
