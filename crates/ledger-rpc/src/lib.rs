//! Ledger RPC - client for the ledger node's JSON action API
//!
//! All signing, proof-of-work and consensus happen inside the ledger node.
//! This crate only speaks its request/response protocol:
//! - `LedgerRpc` trait: the operations the engine consumes
//! - `HttpLedgerClient`: JSON over HTTP POST against a running node
//! - `MemoryLedger`: in-process ledger with the same chain rules (dry runs, tests)

pub mod client;
pub mod error;
pub mod memory;
pub mod types;

pub use client::HttpLedgerClient;
pub use error::LedgerError;
pub use memory::MemoryLedger;
pub use types::{AccountBalance, BlockKind, CreatedBlock};

use async_trait::async_trait;
use std::collections::HashMap;

/// Default ledger node endpoint
pub const DEFAULT_RPC_URL: &str = "http://localhost:7076";

/// Delay between attempts while the ledger node is not reachable yet
pub const CONNECT_RETRY_SECS: u64 = 10;

/// Operations consumed from the ledger node.
///
/// Every implementation is bound to a single wallet; wallet-scoped actions
/// use it implicitly.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Create a new account in the wallet
    async fn create_account(&self) -> Result<String, LedgerError>;

    /// List the wallet's accounts
    async fn list_accounts(&self) -> Result<Vec<String>, LedgerError>;

    /// Hash of the newest block on an account's chain, `None` for an unopened account
    async fn account_head(&self, account: &str) -> Result<Option<String>, LedgerError>;

    /// Confirmed and pending balance of one account
    async fn account_balance(&self, account: &str) -> Result<AccountBalance, LedgerError>;

    /// Balances of every account in the wallet
    async fn wallet_balances(&self) -> Result<HashMap<String, AccountBalance>, LedgerError>;

    /// Sign a send block offline without publishing it.
    ///
    /// `balance` is the account balance before the send.
    async fn create_send_block(
        &self,
        account: &str,
        destination: &str,
        balance: u128,
        amount: u128,
        previous: &str,
    ) -> Result<CreatedBlock, LedgerError>;

    /// Sign a receive block claiming `source` without publishing it
    async fn create_receive_block(
        &self,
        account: &str,
        source: &str,
        previous: &str,
    ) -> Result<CreatedBlock, LedgerError>;

    /// Publish a previously signed block, returning its hash
    async fn process(&self, payload: &str) -> Result<String, LedgerError>;

    /// Create, sign and publish a send in one step, returning the block hash
    async fn send(
        &self,
        source: &str,
        destination: &str,
        amount: u128,
    ) -> Result<String, LedgerError>;

    /// Create, sign and publish a receive for `block`, returning the new hash
    async fn receive(&self, account: &str, block: &str) -> Result<String, LedgerError>;

    /// Hashes of up to `count` sends waiting to be received by `account`
    async fn pending(&self, account: &str, count: usize) -> Result<Vec<String>, LedgerError>;
}
