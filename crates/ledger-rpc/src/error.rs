//! Ledger RPC errors

use thiserror::Error;

/// Errors returned by a ledger implementation.
///
/// Outside the initial connection retry window every variant is fatal to the run.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode ledger response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid amount {0:?}")]
    InvalidAmount(String),

    #[error("ledger reported error for {action}: {message}")]
    Ledger { action: &'static str, message: String },
}

impl LedgerError {
    pub(crate) fn ledger(action: &'static str, message: impl Into<String>) -> Self {
        LedgerError::Ledger {
            action,
            message: message.into(),
        }
    }
}
