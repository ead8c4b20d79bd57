//! Account pool and one-time funding
//!
//! Holds the N wallet accounts the engine cycles through, with the running
//! balance and confirmed chain head of each. Only the coordinator (or the
//! worker it hands the pool to) ever touches it.

use crate::{
    block_buffer::BlockBuffer,
    error::{EngineError, Result},
    progress::ThroughputTracker,
    publisher::PublishedHead,
};
use ledger_rpc::LedgerRpc;
use std::sync::Arc;

/// Pending sends fetched per `pending` call
const PENDING_BATCH: usize = 100;

/// One wallet account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub address: String,
    /// Running balance in raw
    pub balance: u128,
    /// Hash of the newest confirmed block, empty for an unopened chain
    pub head: String,
}

impl Account {
    pub fn new(address: String) -> Self {
        Self {
            address,
            balance: 0,
            head: String::new(),
        }
    }
}

/// Balance and head of an account at the start of an epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCheckpoint {
    pub balance: u128,
    pub head: String,
}

/// The accounts driven by this node
pub struct AccountPool {
    ledger: Arc<dyn LedgerRpc>,
    accounts: Vec<Account>,
}

impl AccountPool {
    /// Build a pool from known accounts without querying the ledger
    pub fn new(ledger: Arc<dyn LedgerRpc>, accounts: Vec<Account>) -> Self {
        Self { ledger, accounts }
    }

    /// Open a pool of `n` accounts: create missing ones, claim pending
    /// receives, then load balances and chain heads.
    pub async fn open(ledger: Arc<dyn LedgerRpc>, n: usize) -> Result<Self> {
        let addresses = get_or_create_accounts(ledger.as_ref(), n).await?;
        let mut pool = Self::new(ledger, addresses.into_iter().map(Account::new).collect());
        pool.refresh().await?;

        let swept = pool.sweep_pending().await?;
        if swept > 0 {
            tracing::info!("Received {} pending blocks across the pool", swept);
        }
        for account in &pool.accounts {
            tracing::info!("Account: {} Balance: {}", account.address, account.balance);
        }
        tracing::info!("Total Balance: {}", pool.total_balance());
        Ok(pool)
    }

    /// Reload every balance and chain head from the ledger
    pub async fn refresh(&mut self) -> Result<()> {
        let balances = self.ledger.wallet_balances().await?;
        for account in &mut self.accounts {
            account.balance = balances
                .get(&account.address)
                .map(|b| b.balance)
                .unwrap_or_default();
            account.head = self
                .ledger
                .account_head(&account.address)
                .await?
                .unwrap_or_default();
        }
        Ok(())
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerRpc> {
        &self.ledger
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn account(&self, index: usize) -> &Account {
        &self.accounts[index]
    }

    pub fn account_mut(&mut self, index: usize) -> &mut Account {
        &mut self.accounts[index]
    }

    /// Sum of running balances
    pub fn total_balance(&self) -> u128 {
        self.accounts.iter().map(|a| a.balance).sum()
    }

    /// Index and balance of the account holding the most; the first one wins ties
    pub fn find_richest(&self) -> Option<(usize, u128)> {
        let mut richest: Option<(usize, u128)> = None;
        for (i, account) in self.accounts.iter().enumerate() {
            match richest {
                Some((_, max)) if account.balance <= max => {}
                _ => richest = Some((i, account.balance)),
            }
        }
        richest
    }

    /// Top every account up to `target`, drawing from the richest account.
    ///
    /// Fails before any transfer if the pool as a whole holds less than
    /// `target × N`. Transfers run one at a time: a send from the source, then
    /// the matching receive, before the next deficit is looked at. Returns the
    /// number of transfers made.
    pub async fn distribute_funds(&mut self, target: u128) -> Result<u64> {
        let required = target.saturating_mul(self.accounts.len() as u128);
        let available = self.total_balance();
        if available < required {
            return Err(EngineError::InsufficientFunds {
                required,
                available,
            });
        }

        let short = self.accounts.iter().filter(|a| a.balance < target).count() as u64;
        let mut tracker = ThroughputTracker::new();
        let mut transfers = 0u64;

        for k in 0..self.accounts.len() {
            while self.accounts[k].balance < target {
                let deficit = target - self.accounts[k].balance;
                let Some((source, richest)) = self.find_richest() else {
                    break;
                };
                // The pre-check guarantees a surplus somewhere while any deficit remains
                let amount = deficit.min(richest.saturating_sub(target));
                if amount == 0 {
                    return Err(EngineError::InsufficientFunds {
                        required,
                        available: self.total_balance(),
                    });
                }

                let started = tokio::time::Instant::now();
                self.transfer(source, k, amount).await?;
                tracker.record(started.elapsed());
                transfers += 1;

                let remaining = short.saturating_sub(tracker.count());
                tracing::info!(
                    "Funded account {} with {} raw from account {} (ETA {:?}, finish {})",
                    k,
                    amount,
                    source,
                    tracker.eta(remaining),
                    tracker.finish_at(remaining).to_rfc2822()
                );
            }
        }

        tracing::info!("Finished setting up accounts ({} transfers)", transfers);
        Ok(transfers)
    }

    /// Move `amount` from account `from` to account `to`, waiting for the receive
    async fn transfer(&mut self, from: usize, to: usize, amount: u128) -> Result<()> {
        let send_hash = self
            .ledger
            .send(&self.accounts[from].address, &self.accounts[to].address, amount)
            .await?;
        self.accounts[from].head = send_hash.clone();
        self.accounts[from].balance -= amount;

        let receive_hash = self
            .ledger
            .receive(&self.accounts[to].address, &send_hash)
            .await?;
        self.accounts[to].head = receive_hash;
        self.accounts[to].balance += amount;
        Ok(())
    }

    /// Claim every pending incoming send on every account. Returns the number received.
    pub async fn sweep_pending(&mut self) -> Result<u64> {
        let mut received = 0u64;
        for account in &mut self.accounts {
            let mut claimed = false;
            loop {
                let pending = self.ledger.pending(&account.address, PENDING_BATCH).await?;
                if pending.is_empty() {
                    break;
                }
                for source in pending {
                    account.head = self.ledger.receive(&account.address, &source).await?;
                    received += 1;
                    claimed = true;
                }
            }
            if claimed {
                account.balance = self.ledger.account_balance(&account.address).await?.balance;
                tracing::debug!("Account {} settled at {} raw", account.address, account.balance);
            }
        }
        Ok(received)
    }

    /// Snapshot every account before production starts
    pub fn checkpoint(&self) -> Vec<AccountCheckpoint> {
        self.accounts
            .iter()
            .map(|a| AccountCheckpoint {
                balance: a.balance,
                head: a.head.clone(),
            })
            .collect()
    }

    /// Align the pool with what actually reached the ledger.
    ///
    /// Accounts with a published block take the hash the ledger returned and
    /// the balance recorded in that block;
    /// accounts with nothing published go back to their checkpoint. Blocks
    /// produced but never published are forgotten.
    pub fn settle(
        &mut self,
        checkpoint: &[AccountCheckpoint],
        buffer: &BlockBuffer,
        heads: &[Option<PublishedHead>],
    ) {
        for (i, account) in self.accounts.iter_mut().enumerate() {
            let published = heads
                .get(i)
                .and_then(Option::as_ref)
                .and_then(|head| buffer.get(i, head.round).map(|entry| (head, entry)));
            match (published, checkpoint.get(i)) {
                (Some((head, entry)), _) => {
                    account.head = head.hash.clone();
                    account.balance = entry.block.balance_after;
                }
                (None, Some(saved)) => {
                    account.head = saved.head.clone();
                    account.balance = saved.balance;
                }
                (None, None) => {}
            }
        }
    }
}

/// Return `n` wallet accounts, creating any that are missing
pub async fn get_or_create_accounts(ledger: &dyn LedgerRpc, n: usize) -> Result<Vec<String>> {
    let mut accounts: Vec<String> = ledger
        .list_accounts()
        .await?
        .into_iter()
        .filter(|a| !a.is_empty())
        .collect();

    if accounts.len() < n {
        tracing::info!(
            "Wallet has {} accounts, creating {} more",
            accounts.len(),
            n - accounts.len()
        );
    }
    while accounts.len() < n {
        accounts.push(ledger.create_account().await?);
    }
    accounts.truncate(n);
    Ok(accounts)
}
