//! Known peer addresses
//!
//! The set only grows. Addresses known to be this node are kept apart and
//! never enter it.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;

#[derive(Debug, Default)]
struct Inner {
    peers: BTreeSet<SocketAddr>,
    /// Our address as seen on the first outbound connection
    local: Option<SocketAddr>,
    /// Other addresses that turned out to reach us
    aliases: BTreeSet<SocketAddr>,
}

#[derive(Debug, Default)]
pub struct PeerSet {
    inner: Mutex<Inner>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns false for ourselves and for known peers.
    pub fn insert(&self, addr: SocketAddr) -> bool {
        let mut inner = self.inner.lock();
        if inner.local == Some(addr) || inner.aliases.contains(&addr) {
            return false;
        }
        inner.peers.insert(addr)
    }

    /// Record our own address. Only the first call has any effect.
    pub fn set_local(&self, addr: SocketAddr) -> bool {
        let mut inner = self.inner.lock();
        if inner.local.is_some() || inner.peers.contains(&addr) {
            return false;
        }
        inner.local = Some(addr);
        true
    }

    /// Remember an address that turned out to be ourselves
    pub fn mark_self(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        if !inner.peers.contains(&addr) {
            inner.aliases.insert(addr);
        }
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.inner.lock().local
    }

    pub fn is_self(&self, addr: &SocketAddr) -> bool {
        let inner = self.inner.lock();
        inner.local.as_ref() == Some(addr) || inner.aliases.contains(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.inner.lock().peers.contains(addr)
    }

    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.inner.lock().peers.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let set = PeerSet::new();
        assert!(set.insert(addr("10.0.0.1:9887")));
        assert!(!set.insert(addr("10.0.0.1:9887")));
        assert!(set.insert(addr("10.0.0.2:9887")));
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.snapshot(),
            vec![addr("10.0.0.1:9887"), addr("10.0.0.2:9887")]
        );
    }

    #[test]
    fn test_local_address_never_enters() {
        let set = PeerSet::new();
        assert!(set.set_local(addr("10.0.0.9:9887")));
        // Only the first connection decides
        assert!(!set.set_local(addr("10.0.0.8:9887")));
        assert_eq!(set.local(), Some(addr("10.0.0.9:9887")));

        assert!(!set.insert(addr("10.0.0.9:9887")));
        assert!(set.is_self(&addr("10.0.0.9:9887")));
        assert!(set.is_empty());
    }

    #[test]
    fn test_alias_never_enters_and_set_never_shrinks() {
        let set = PeerSet::new();
        set.insert(addr("10.0.0.1:9887"));
        set.mark_self(addr("192.168.1.5:9887"));
        assert!(!set.insert(addr("192.168.1.5:9887")));

        // A known peer is not demoted
        set.mark_self(addr("10.0.0.1:9887"));
        assert!(set.contains(&addr("10.0.0.1:9887")));
        assert!(!set.is_self(&addr("10.0.0.1:9887")));
        assert_eq!(set.len(), 1);
    }
}
