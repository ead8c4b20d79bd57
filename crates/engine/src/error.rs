//! Engine errors

use ledger_rpc::LedgerError;
use thiserror::Error;

/// Errors that end a run.
///
/// None of these are retried; the binary reports them and exits.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("ledger call failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("insufficient funds: need at least {required} raw, wallet holds {available} raw")]
    InsufficientFunds { required: u128, available: u128 },

    #[error("halt handshake violated: {0}")]
    HandshakeViolation(String),

    #[error("precompute worker failed: {0}")]
    WorkerFailed(String),

    #[error("block for account {account} round {round} was counted but never buffered")]
    MissingBlock { account: usize, round: usize },
}

pub type Result<T> = std::result::Result<T, EngineError>;
