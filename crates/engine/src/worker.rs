//! Precompute worker
//!
//! Signs blocks ahead of the deadline without publishing them. Even epochs
//! produce sends (each account pays one unit to the next account in the
//! pool), odd epochs produce the receives that claim them. Blocks are made in
//! round-robin order: block `k` belongs to account `k mod N`, round `k div N`.
//!
//! The worker owns the pipeline state while it runs and hands it back when
//! its task completes. It checks its control channel once per block; a ledger
//! call already in flight always finishes first.

use crate::{
    account_pool::{AccountCheckpoint, AccountPool},
    block_buffer::{BlockBuffer, PendingBlock},
    error::{EngineError, Result},
    progress::ThroughputTracker,
    publisher::PublishReport,
    schedule::time_until,
};
use chrono::{DateTime, Utc};
use ledger_rpc::{BlockKind, LedgerRpc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::Instant,
};

/// What an epoch produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochMode {
    Send,
    Receive,
}

impl EpochMode {
    /// Even epochs send, odd epochs receive
    pub fn for_epoch(epoch: u64) -> Self {
        if epoch % 2 == 0 {
            EpochMode::Send
        } else {
            EpochMode::Receive
        }
    }
}

impl fmt::Display for EpochMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochMode::Send => write!(f, "send"),
            EpochMode::Receive => write!(f, "receive"),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Blocks per account per epoch (`None` = until halted or out of funds)
    pub rounds: Option<usize>,
    /// Raw moved by each send
    pub amount: u128,
    /// Blocks between progress lines
    pub progress_interval: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rounds: None,
            amount: 1,
            progress_interval: 100,
        }
    }
}

/// Coordinator to worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Halt,
}

/// Worker to coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Acknowledges `Halt`; always followed by `Produced`
    Halted,
    /// Blocks produced before halting
    Produced(u64),
    /// Stopped on its own after producing this many blocks
    Exhausted(u64),
}

/// Everything the coordinator hands to the worker and gets back
pub struct PipelineState {
    pub pool: AccountPool,
    /// Blocks of the current epoch
    pub buffer: BlockBuffer,
    /// Sends of the previous send epoch, claimed by the receive epoch
    pub prior_sends: BlockBuffer,
    /// How many of `prior_sends` reached the ledger
    pub sends_published: u64,
    /// Pool state at the start of the current epoch
    pub checkpoint: Vec<AccountCheckpoint>,
}

impl PipelineState {
    pub fn new(pool: AccountPool, buffer_capacity: usize) -> Self {
        let accounts = pool.len();
        let checkpoint = pool.checkpoint();
        Self {
            pool,
            buffer: BlockBuffer::new(accounts, buffer_capacity),
            prior_sends: BlockBuffer::new(accounts, buffer_capacity),
            sends_published: 0,
            checkpoint,
        }
    }

    /// Reset the epoch buffer and remember where every account started
    pub fn begin_epoch(&mut self) {
        self.buffer.clear();
        self.checkpoint = self.pool.checkpoint();
    }

    /// Fold a publish pass back into the pool.
    ///
    /// After a send epoch the published sends become the claim list for the
    /// following receive epoch.
    pub fn finish_epoch(&mut self, mode: EpochMode, report: &PublishReport) {
        self.pool.settle(&self.checkpoint, &self.buffer, &report.heads);
        match mode {
            EpochMode::Send => {
                std::mem::swap(&mut self.buffer, &mut self.prior_sends);
                self.sends_published = report.published;
            }
            EpochMode::Receive => {
                self.sends_published = 0;
            }
        }
        self.buffer.clear();
    }
}

/// Coordinator side of a running worker
pub struct WorkerHandle {
    control: mpsc::Sender<WorkerCommand>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    task: JoinHandle<Result<PipelineState>>,
}

impl WorkerHandle {
    /// Next event from the worker, `None` once it has stopped
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Run the halt handshake: `Halt`, then `Halted`, then `Produced(count)`.
    ///
    /// A worker that ran out of work before seeing `Halt` answers with
    /// `Exhausted(count)` instead, which is accepted. Returns `None` if the
    /// worker stopped without a word; `join` then reports why.
    pub async fn halt(&mut self) -> Result<Option<u64>> {
        // A closed control channel means the worker already stopped; its
        // final events are still queued.
        let _ = self.control.send(WorkerCommand::Halt).await;

        match self.events.recv().await {
            Some(WorkerEvent::Halted) => match self.events.recv().await {
                Some(WorkerEvent::Produced(count)) => Ok(Some(count)),
                Some(other) => Err(EngineError::HandshakeViolation(format!(
                    "expected produced count after halted, got {:?}",
                    other
                ))),
                None => Err(EngineError::HandshakeViolation(
                    "worker stopped between halted and produced count".to_string(),
                )),
            },
            Some(WorkerEvent::Exhausted(count)) => Ok(Some(count)),
            Some(other) => Err(EngineError::HandshakeViolation(format!(
                "expected halted, got {:?}",
                other
            ))),
            None => Ok(None),
        }
    }

    /// Wait for the worker task and take the pipeline state back
    pub async fn join(self) -> Result<PipelineState> {
        self.task
            .await
            .map_err(|e| EngineError::WorkerFailed(e.to_string()))?
    }
}

/// Background block producer
pub struct PrecomputeWorker {
    state: PipelineState,
    ledger: Arc<dyn LedgerRpc>,
    config: WorkerConfig,
    mode: EpochMode,
    /// Most blocks this epoch may produce
    limit: Option<u64>,
    deadline: Option<DateTime<Utc>>,
    control: mpsc::Receiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl PrecomputeWorker {
    /// Start producing on a background task
    pub fn spawn(
        state: PipelineState,
        config: WorkerConfig,
        mode: EpochMode,
        limit: Option<u64>,
        deadline: Option<DateTime<Utc>>,
    ) -> WorkerHandle {
        let (control_tx, control_rx) = mpsc::channel(4);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ledger = state.pool.ledger().clone();

        let worker = Self {
            state,
            ledger,
            config,
            mode,
            limit,
            deadline,
            control: control_rx,
            events: events_tx,
        };
        let task = tokio::spawn(worker.run());

        WorkerHandle {
            control: control_tx,
            events: events_rx,
            task,
        }
    }

    async fn run(mut self) -> Result<PipelineState> {
        let accounts = self.state.pool.len() as u64;
        let mut produced = 0u64;
        let mut tracker = ThroughputTracker::new();

        tracing::info!(
            "Begin precomputing {} blocks across {} accounts",
            self.mode,
            accounts
        );

        loop {
            match self.control.try_recv() {
                Ok(WorkerCommand::Halt) => {
                    let _ = self.events.send(WorkerEvent::Halted);
                    tracing::info!("Halting precomputation after {} blocks", produced);
                    let _ = self.events.send(WorkerEvent::Produced(produced));
                    return Ok(self.state);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!("Coordinator went away, stopping after {} blocks", produced);
                    return Ok(self.state);
                }
            }

            let exhausted = if accounts == 0 {
                Some("empty account pool")
            } else {
                let account = (produced % accounts) as usize;
                let round = (produced / accounts) as usize;
                self.exhausted(account, round, produced)
            };
            if let Some(reason) = exhausted {
                tracing::info!("Finished precomputing blocks: {} ({} blocks)", reason, produced);
                let _ = self.events.send(WorkerEvent::Exhausted(produced));
                return Ok(self.state);
            }

            let account = (produced % accounts) as usize;
            let round = (produced / accounts) as usize;
            let started = Instant::now();
            match self.mode {
                EpochMode::Send => self.produce_send(account, round).await?,
                EpochMode::Receive => self.produce_receive(account, round).await?,
            }
            tracker.record(started.elapsed());
            produced += 1;

            if produced % self.config.progress_interval.max(1) == 0 {
                self.report_progress(&tracker, produced);
            }
        }
    }

    /// Why production must stop before block `(account, round)`, if it must
    fn exhausted(&self, account: usize, round: usize, produced: u64) -> Option<&'static str> {
        if matches!(self.config.rounds, Some(rounds) if round >= rounds) {
            return Some("round limit reached");
        }
        if matches!(self.limit, Some(limit) if produced >= limit) {
            return Some("maximum reached");
        }
        match self.mode {
            EpochMode::Send => {
                if self.state.pool.account(account).balance < self.config.amount {
                    return Some("account balance exhausted");
                }
            }
            EpochMode::Receive => {
                let accounts = self.state.pool.len();
                let source = predecessor(account, accounts);
                let position = (round * accounts + source) as u64;
                if position >= self.state.sends_published
                    || self.state.prior_sends.get(source, round).is_none()
                {
                    return Some("no published send left to claim");
                }
            }
        }
        None
    }

    /// Previous hash for `(account, round)`: the block before it in the buffer,
    /// or the confirmed chain head for round 0.
    fn previous_hash(&self, account: usize, round: usize) -> Result<String> {
        if round == 0 {
            return Ok(self.state.pool.account(account).head.clone());
        }
        self.state
            .buffer
            .get(account, round - 1)
            .map(|entry| entry.hash.clone())
            .ok_or(EngineError::MissingBlock {
                account,
                round: round - 1,
            })
    }

    async fn produce_send(&mut self, account: usize, round: usize) -> Result<()> {
        let accounts = self.state.pool.len();
        let previous = self.previous_hash(account, round)?;
        let sender = self.state.pool.account(account).clone();
        let destination = self
            .state
            .pool
            .account((account + 1) % accounts)
            .address
            .clone();
        let amount = self.config.amount;

        let created = self
            .ledger
            .create_send_block(&sender.address, &destination, sender.balance, amount, &previous)
            .await?;

        let balance_after = sender.balance - amount;
        self.state.pool.account_mut(account).balance = balance_after;
        self.state.buffer.append(
            account,
            round,
            created.hash,
            PendingBlock {
                kind: BlockKind::Send,
                account: sender.address,
                counterpart: destination,
                balance_after,
                amount,
                previous,
                payload: created.payload,
            },
        );
        Ok(())
    }

    async fn produce_receive(&mut self, account: usize, round: usize) -> Result<()> {
        let accounts = self.state.pool.len();
        let previous = self.previous_hash(account, round)?;
        let source_account = predecessor(account, accounts);
        let source = self
            .state
            .prior_sends
            .get(source_account, round)
            .ok_or(EngineError::MissingBlock {
                account: source_account,
                round,
            })?;
        let source_hash = source.hash.clone();
        let amount = source.block.amount;
        let receiver = self.state.pool.account(account).clone();

        let created = self
            .ledger
            .create_receive_block(&receiver.address, &source_hash, &previous)
            .await?;

        let balance_after = receiver.balance + amount;
        self.state.pool.account_mut(account).balance = balance_after;
        self.state.buffer.append(
            account,
            round,
            created.hash,
            PendingBlock {
                kind: BlockKind::Receive,
                account: receiver.address,
                counterpart: source_hash,
                balance_after,
                amount,
                previous,
                payload: created.payload,
            },
        );
        Ok(())
    }

    fn report_progress(&self, tracker: &ThroughputTracker, produced: u64) {
        let projected = match self.deadline {
            Some(deadline) => tracker.projected_total(time_until(deadline, Utc::now())),
            None => produced,
        };
        let expected = self
            .config
            .rounds
            .map(|rounds| (rounds * self.state.pool.len()) as u64);
        match expected {
            Some(expected) if expected > 0 => tracing::info!(
                "Block: {}/{}, {:.1}% ({:?}/block, ~{} by deadline)",
                produced,
                expected,
                produced as f64 / expected as f64 * 100.0,
                tracker.average().unwrap_or_default(),
                projected
            ),
            _ => tracing::info!(
                "Block: {} ({:?}/block, ~{} by deadline)",
                produced,
                tracker.average().unwrap_or_default(),
                projected
            ),
        }
    }
}

/// Round-robin predecessor: the account whose send `account` claims
pub fn predecessor(account: usize, accounts: usize) -> usize {
    (account + accounts - 1) % accounts
}
