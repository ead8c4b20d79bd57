//! Round-indexed store of precomputed blocks
//!
//! One arena holds `accounts × capacity` slots, laid out account-major. Every
//! account always has the same capacity so that round `r` means the same
//! position in the production order for all of them.

use ledger_rpc::BlockKind;

/// A signed block waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlock {
    pub kind: BlockKind,
    /// Account whose chain this block extends
    pub account: String,
    /// Destination account (send) or source block hash (receive)
    pub counterpart: String,
    pub balance_after: u128,
    pub amount: u128,
    pub previous: String,
    /// Opaque payload returned by the ledger's block creation
    pub payload: String,
}

/// A produced block and the hash it will have on the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedBlock {
    pub hash: String,
    pub block: PendingBlock,
}

/// Growable `(account, round)` indexed block store
#[derive(Debug, Clone)]
pub struct BlockBuffer {
    accounts: usize,
    capacity: usize,
    slots: Vec<Option<BufferedBlock>>,
}

impl BlockBuffer {
    /// Create a buffer for `accounts` accounts with `capacity` rounds each
    pub fn new(accounts: usize, capacity: usize) -> Self {
        Self {
            accounts,
            capacity,
            slots: vec![None; accounts * capacity],
        }
    }

    /// Number of accounts
    pub fn accounts(&self) -> usize {
        self.accounts
    }

    /// Rounds currently allocated per account (identical for every account)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a block at `(account, round)`, growing every account first if needed
    pub fn append(&mut self, account: usize, round: usize, hash: String, block: PendingBlock) {
        assert!(account < self.accounts, "account {} out of range", account);
        if round >= self.capacity {
            let mut capacity = self.capacity;
            while round >= capacity {
                capacity = 2 * capacity + 2;
            }
            self.grow(capacity);
        }
        let index = self.index(account, round);
        self.slots[index] = Some(BufferedBlock { hash, block });
    }

    /// The block at `(account, round)`, or `None` if it has not been produced
    pub fn get(&self, account: usize, round: usize) -> Option<&BufferedBlock> {
        if account >= self.accounts || round >= self.capacity {
            return None;
        }
        self.slots[self.index(account, round)].as_ref()
    }

    /// Drop every stored block, keeping the allocation
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn index(&self, account: usize, round: usize) -> usize {
        account * self.capacity + round
    }

    /// Reallocate all accounts at once, copying each account's rounds to the
    /// same round index in the new layout.
    fn grow(&mut self, capacity: usize) {
        tracing::debug!(
            "Growing block buffer from {} to {} rounds for {} accounts",
            self.capacity,
            capacity,
            self.accounts
        );
        let mut slots = vec![None; self.accounts * capacity];
        for account in 0..self.accounts {
            let old = account * self.capacity;
            let new = account * capacity;
            for round in 0..self.capacity {
                slots[new + round] = self.slots[old + round].take();
            }
        }
        self.slots = slots;
        self.capacity = capacity;
    }
}
