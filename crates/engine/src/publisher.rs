//! Publish pipeline
//!
//! Replays the buffer in exactly the order it was produced: block `k` is
//! account `k mod N` at round `k div N`. The ledger rejects a block whose
//! predecessor it has not seen, so this order is not negotiable.

use crate::{
    block_buffer::BlockBuffer,
    error::{EngineError, Result},
    progress::ThroughputTracker,
};
use ledger_rpc::LedgerRpc;
use std::time::Duration;
use tokio::time::Instant;

/// Blocks between progress lines
const PROGRESS_INTERVAL: u64 = 100;

/// Newest block of an account that reached the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedHead {
    pub round: usize,
    /// Hash returned by the ledger
    pub hash: String,
}

/// Outcome of one publish pass
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub published: u64,
    pub elapsed: Duration,
    /// Blocks per second over the whole pass
    pub tps: f64,
    /// Per account, the last block published this pass
    pub heads: Vec<Option<PublishedHead>>,
}

/// Submit the first `min(produced, max)` buffered blocks in production order
pub async fn publish(
    ledger: &dyn LedgerRpc,
    buffer: &BlockBuffer,
    produced: u64,
    max: Option<u64>,
) -> Result<PublishReport> {
    let accounts = buffer.accounts();
    let target = if accounts == 0 {
        0
    } else {
        max.map_or(produced, |m| produced.min(m))
    };
    let mut heads: Vec<Option<PublishedHead>> = vec![None; accounts];
    let mut tracker = ThroughputTracker::new();
    let started = Instant::now();

    tracing::info!("Begin publishing {} blocks", target);

    let mut published = 0u64;
    while published < target {
        let account = (published % accounts as u64) as usize;
        let round = (published / accounts as u64) as usize;
        let entry = buffer
            .get(account, round)
            .ok_or(EngineError::MissingBlock { account, round })?;

        let call_start = Instant::now();
        let hash = ledger.process(&entry.block.payload).await?;
        tracker.record(call_start.elapsed());

        if hash != entry.hash {
            tracing::warn!(
                "Ledger returned hash {} for block expected as {} (account {}, round {})",
                hash,
                entry.hash,
                account,
                round
            );
        }
        heads[account] = Some(PublishedHead { round, hash });
        published += 1;

        if published % PROGRESS_INTERVAL == 0 {
            let remaining = target - published;
            tracing::info!(
                "Block: {}/{}, {:.1}% ETA: {:?} Finish: {}",
                published,
                target,
                published as f64 / target as f64 * 100.0,
                tracker.eta(remaining),
                tracker.finish_at(remaining).to_rfc2822()
            );
        }
    }

    let elapsed = started.elapsed();
    let tps = if elapsed.as_secs_f64() > 0.0 {
        published as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    tracing::info!("Finished publishing {} blocks in {:?}", published, elapsed);

    Ok(PublishReport {
        published,
        elapsed,
        tps,
        heads,
    })
}
