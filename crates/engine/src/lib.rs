//! Storm Engine - precompute ahead, publish on the deadline
//!
//! This crate holds the producer/consumer pipeline:
//! - Account pool with one-time funding
//! - Round-indexed block buffer
//! - Cancellable precompute worker (send/receive epochs)
//! - Ordered publish pipeline
//! - Wall-clock epoch scheduling and the coordinator tying it together

pub mod account_pool;
pub mod block_buffer;
pub mod coordinator;
pub mod error;
pub mod progress;
pub mod publisher;
pub mod schedule;
pub mod worker;

#[cfg(test)]
mod tests;

pub use account_pool::{Account, AccountCheckpoint, AccountPool};
pub use block_buffer::{BlockBuffer, BufferedBlock, PendingBlock};
pub use coordinator::{CoordinatorConfig, CoordinatorEvent, EpochSummary, ScheduleCoordinator};
pub use error::EngineError;
pub use publisher::{PublishReport, PublishedHead};
pub use schedule::EpochSchedule;
pub use worker::{
    EpochMode, PipelineState, PrecomputeWorker, WorkerCommand, WorkerConfig, WorkerEvent,
    WorkerHandle,
};

/// Rounds allocated per account before the first grow
pub const DEFAULT_BUFFER_CAPACITY: usize = 10;

/// Default epoch length (5 minutes)
pub const DEFAULT_EPOCH_SECS: u64 = 300;
