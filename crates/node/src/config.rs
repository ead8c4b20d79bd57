//! Node Configuration

use anyhow::{bail, Result};
use ledger_rpc::DEFAULT_RPC_URL;
use serde::{Deserialize, Serialize};
use storm_engine::{CoordinatorConfig, DEFAULT_BUFFER_CAPACITY};
use storm_gossip::GossipConfig;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Wallet holding the pool accounts
    pub wallet: String,
    /// Pool size
    pub accounts: usize,
    /// Blocks per epoch across the whole pool
    pub transactions: u64,
    /// Ledger node RPC endpoint
    pub rpc_url: String,
    /// Rounds per account the block buffer starts with
    pub buffer_capacity: usize,
    /// Publish to an in-memory ledger instead of `rpc_url`
    pub dry_run: bool,
    pub coordinator: CoordinatorConfig,
    pub gossip: GossipConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            wallet: String::new(),
            accounts: 100,
            transactions: 30_000,
            rpc_url: DEFAULT_RPC_URL.to_string(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            dry_run: false,
            coordinator: CoordinatorConfig::default(),
            gossip: GossipConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Blocks each account produces per epoch
    pub fn rounds_per_account(&self) -> u64 {
        if self.accounts == 0 {
            return 0;
        }
        self.transactions / self.accounts as u64
    }

    /// Balance every account is funded to before the first epoch
    pub fn funding_target(&self) -> u128 {
        self.rounds_per_account() as u128 * self.coordinator.worker.amount
    }

    /// Fill in the derived settings and check the result
    pub fn finalize(mut self) -> Result<Self> {
        if self.wallet.is_empty() {
            bail!("a wallet is required (--wallet)");
        }
        if self.accounts == 0 {
            bail!("the pool needs at least one account");
        }
        let rounds = self.rounds_per_account();
        if rounds == 0 {
            bail!(
                "{} transactions over {} accounts leaves nothing to send",
                self.transactions,
                self.accounts
            );
        }
        self.coordinator.worker.rounds = Some(rounds as usize);
        self.gossip.epoch_secs = self.coordinator.epoch_secs;
        Ok(self)
    }
}
