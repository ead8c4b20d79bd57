//! In-process ledger
//!
//! Enforces the same per-account chain rules as a real node (a block must
//! reference the current head, sends need funds, receives need a matching
//! pending send) without any network, signing or work. Used for `--dry-run`
//! and by the engine tests.

use crate::{
    error::LedgerError,
    types::{AccountBalance, BlockKind, CreatedBlock},
    LedgerRpc,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

/// Signed payload format produced by `MemoryLedger`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoryBlock {
    hash: String,
    kind: BlockKind,
    account: String,
    /// Destination for sends, source hash for receives
    link: String,
    /// Balance before the block, sends only
    balance: u128,
    amount: u128,
    previous: String,
}

#[derive(Debug, Default)]
struct Chain {
    blocks: Vec<String>,
    balance: u128,
}

impl Chain {
    fn head(&self) -> &str {
        self.blocks.last().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone)]
struct PendingSend {
    destination: String,
    amount: u128,
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Wallet accounts in creation order
    accounts: Vec<String>,
    chains: HashMap<String, Chain>,
    pending: BTreeMap<String, PendingSend>,
    next_hash: u64,
    processed: u64,
}

impl LedgerState {
    fn fresh_hash(&mut self) -> String {
        self.next_hash += 1;
        format!("{:064X}", self.next_hash)
    }

    fn chain_mut(
        &mut self,
        action: &'static str,
        account: &str,
    ) -> Result<&mut Chain, LedgerError> {
        self.chains
            .get_mut(account)
            .ok_or_else(|| LedgerError::ledger(action, "Account not found"))
    }

    fn debit(
        &mut self,
        action: &'static str,
        account: &str,
        destination: &str,
        amount: u128,
        hash: String,
    ) -> Result<(), LedgerError> {
        let chain = self.chain_mut(action, account)?;
        if chain.balance < amount {
            return Err(LedgerError::ledger(action, "Insufficient balance"));
        }
        chain.balance -= amount;
        chain.blocks.push(hash.clone());
        self.pending.insert(
            hash,
            PendingSend {
                destination: destination.to_string(),
                amount,
            },
        );
        Ok(())
    }

    fn credit(
        &mut self,
        action: &'static str,
        account: &str,
        source: &str,
        hash: String,
    ) -> Result<(), LedgerError> {
        let amount = match self.pending.get(source) {
            Some(send) if send.destination == account => send.amount,
            _ => return Err(LedgerError::ledger(action, "Unreceivable")),
        };
        let chain = self.chain_mut(action, account)?;
        chain.balance += amount;
        chain.blocks.push(hash);
        self.pending.remove(source);
        Ok(())
    }
}

/// In-memory ledger bound to one wallet
pub struct MemoryLedger {
    wallet: String,
    state: Mutex<LedgerState>,
    latency: Duration,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new(wallet: &str) -> Self {
        Self {
            wallet: wallet.to_string(),
            state: Mutex::new(LedgerState::default()),
            latency: Duration::ZERO,
        }
    }

    /// Create a ledger whose wallet already holds one opened account per balance
    pub fn with_balances(wallet: &str, balances: &[u128]) -> Self {
        let ledger = Self::new(wallet);
        {
            let mut state = ledger.state.lock();
            for (i, balance) in balances.iter().enumerate() {
                let account = format!("acct_{}", i);
                let mut chain = Chain::default();
                if *balance > 0 {
                    chain.blocks.push(state.fresh_hash());
                    chain.balance = *balance;
                }
                state.chains.insert(account.clone(), chain);
                state.accounts.push(account);
            }
        }
        ledger
    }

    /// Delay every signing and publishing call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Confirmed balance of an account (0 if unknown)
    pub fn balance_of(&self, account: &str) -> u128 {
        self.state
            .lock()
            .chains
            .get(account)
            .map(|c| c.balance)
            .unwrap_or(0)
    }

    /// Head hash of an account's chain
    pub fn head_of(&self, account: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .chains
            .get(account)
            .and_then(|c| c.blocks.last().cloned())
    }

    /// Sum of confirmed balances over the wallet
    pub fn total_balance(&self) -> u128 {
        self.state.lock().chains.values().map(|c| c.balance).sum()
    }

    /// Sum of amounts sent but not yet received
    pub fn total_pending(&self) -> u128 {
        self.state.lock().pending.values().map(|p| p.amount).sum()
    }

    /// Number of blocks published through `process`
    pub fn processed_count(&self) -> u64 {
        self.state.lock().processed
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn create_block(
        &self,
        kind: BlockKind,
        account: &str,
        link: &str,
        balance: u128,
        amount: u128,
        previous: &str,
    ) -> Result<CreatedBlock, LedgerError> {
        let mut state = self.state.lock();
        if !state.chains.contains_key(account) {
            return Err(LedgerError::ledger(
                "block_create",
                format!("Account not found in wallet {}", self.wallet),
            ));
        }
        let hash = state.fresh_hash();
        let block = MemoryBlock {
            hash: hash.clone(),
            kind,
            account: account.to_string(),
            link: link.to_string(),
            balance,
            amount,
            previous: previous.to_string(),
        };
        Ok(CreatedBlock {
            hash,
            payload: serde_json::to_string(&block)?,
        })
    }
}

#[async_trait]
impl LedgerRpc for MemoryLedger {
    async fn create_account(&self) -> Result<String, LedgerError> {
        let mut state = self.state.lock();
        let account = format!("acct_{}", state.accounts.len());
        state.chains.insert(account.clone(), Chain::default());
        state.accounts.push(account.clone());
        Ok(account)
    }

    async fn list_accounts(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self.state.lock().accounts.clone())
    }

    async fn account_head(&self, account: &str) -> Result<Option<String>, LedgerError> {
        Ok(self.head_of(account))
    }

    async fn account_balance(&self, account: &str) -> Result<AccountBalance, LedgerError> {
        let state = self.state.lock();
        let chain = state
            .chains
            .get(account)
            .ok_or_else(|| LedgerError::ledger("account_balance", "Account not found"))?;
        let pending = state
            .pending
            .values()
            .filter(|p| p.destination == account)
            .map(|p| p.amount)
            .sum();
        Ok(AccountBalance {
            balance: chain.balance,
            pending,
        })
    }

    async fn wallet_balances(&self) -> Result<HashMap<String, AccountBalance>, LedgerError> {
        let accounts = self.state.lock().accounts.clone();
        let mut balances = HashMap::with_capacity(accounts.len());
        for account in accounts {
            let balance = self.account_balance(&account).await?;
            balances.insert(account, balance);
        }
        Ok(balances)
    }

    async fn create_send_block(
        &self,
        account: &str,
        destination: &str,
        balance: u128,
        amount: u128,
        previous: &str,
    ) -> Result<CreatedBlock, LedgerError> {
        self.simulate_latency().await;
        self.create_block(BlockKind::Send, account, destination, balance, amount, previous)
    }

    async fn create_receive_block(
        &self,
        account: &str,
        source: &str,
        previous: &str,
    ) -> Result<CreatedBlock, LedgerError> {
        self.simulate_latency().await;
        self.create_block(BlockKind::Receive, account, source, 0, 0, previous)
    }

    async fn process(&self, payload: &str) -> Result<String, LedgerError> {
        self.simulate_latency().await;
        let block: MemoryBlock = serde_json::from_str(payload)?;

        let mut state = self.state.lock();
        let chain = state.chain_mut("process", &block.account)?;
        if chain.blocks.contains(&block.hash) {
            return Err(LedgerError::ledger("process", "Old block"));
        }
        if chain.head() != block.previous {
            return Err(LedgerError::ledger("process", "Gap previous block"));
        }
        match block.kind {
            BlockKind::Send => {
                if chain.balance != block.balance {
                    return Err(LedgerError::ledger("process", "Balance mismatch"));
                }
                state.debit(
                    "process",
                    &block.account,
                    &block.link,
                    block.amount,
                    block.hash.clone(),
                )?;
            }
            BlockKind::Receive => {
                state.credit("process", &block.account, &block.link, block.hash.clone())?;
            }
        }
        state.processed += 1;
        Ok(block.hash)
    }

    async fn send(
        &self,
        source: &str,
        destination: &str,
        amount: u128,
    ) -> Result<String, LedgerError> {
        let mut state = self.state.lock();
        let hash = state.fresh_hash();
        state.debit("send", source, destination, amount, hash.clone())?;
        Ok(hash)
    }

    async fn receive(&self, account: &str, block: &str) -> Result<String, LedgerError> {
        let mut state = self.state.lock();
        let hash = state.fresh_hash();
        state.credit("receive", account, block, hash.clone())?;
        Ok(hash)
    }

    async fn pending(&self, account: &str, count: usize) -> Result<Vec<String>, LedgerError> {
        let state = self.state.lock();
        Ok(state
            .pending
            .iter()
            .filter(|(_, p)| p.destination == account)
            .take(count)
            .map(|(hash, _)| hash.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_enforces_chain_continuity() {
        let ledger = MemoryLedger::with_balances("W", &[10, 0]);
        let head = ledger.head_of("acct_0").unwrap();

        let first = ledger
            .create_send_block("acct_0", "acct_1", 10, 1, &head)
            .await
            .unwrap();
        let second = ledger
            .create_send_block("acct_0", "acct_1", 9, 1, &first.hash)
            .await
            .unwrap();

        // Out of order is rejected
        assert!(ledger.process(&second.payload).await.is_err());

        assert_eq!(ledger.process(&first.payload).await.unwrap(), first.hash);
        assert_eq!(ledger.process(&second.payload).await.unwrap(), second.hash);
        assert_eq!(ledger.balance_of("acct_0"), 8);
        assert_eq!(ledger.total_pending(), 2);
        assert_eq!(ledger.processed_count(), 2);
    }

    #[tokio::test]
    async fn test_receive_opens_account() {
        let ledger = MemoryLedger::with_balances("W", &[10, 0]);
        let send = ledger.send("acct_0", "acct_1", 4).await.unwrap();

        assert_eq!(ledger.pending("acct_1", 10).await.unwrap(), vec![send.clone()]);
        let created = ledger.create_receive_block("acct_1", &send, "").await.unwrap();
        ledger.process(&created.payload).await.unwrap();

        assert_eq!(ledger.balance_of("acct_1"), 4);
        assert_eq!(ledger.head_of("acct_1"), Some(created.hash));
        assert!(ledger.pending("acct_1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_requires_matching_destination() {
        let ledger = MemoryLedger::with_balances("W", &[10, 0, 0]);
        let send = ledger.send("acct_0", "acct_1", 4).await.unwrap();
        assert!(ledger.receive("acct_2", &send).await.is_err());
        assert!(ledger.receive("acct_1", &send).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_account_appends_to_wallet() {
        let ledger = MemoryLedger::new("W");
        let a = ledger.create_account().await.unwrap();
        let b = ledger.create_account().await.unwrap();
        assert_eq!(ledger.list_accounts().await.unwrap(), vec![a, b]);
        assert_eq!(ledger.account_head("acct_0").await.unwrap(), None);
    }
}
