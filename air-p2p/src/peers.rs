//! Ordered, de-duplicated peer address list.

use serde::{Deserialize, Serialize};

/// The addresses this node uses for network connectivity.
///
/// Insertion order is preserved and every address appears at most once.
/// Peers are only ever added; nothing in the core removes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct PeerSet {
    addrs: Vec<String>,
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `addr` unless it is already present. Returns true if it was added.
    pub fn insert(&mut self, addr: impl Into<String>) -> bool {
        let addr = addr.into();
        if self.contains(&addr) {
            return false;
        }
        self.addrs.push(addr);
        true
    }

    /// Append every unseen address, returning the ones that were new.
    pub fn extend<I, S>(&mut self, addrs: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = Vec::new();
        for addr in addrs {
            let addr = addr.into();
            if self.insert(addr.clone()) {
                added.push(addr);
            }
        }
        added
    }

    /// Whether `addr` is already known.
    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.iter().any(|a| a == addr)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.addrs.iter()
    }

    /// Borrow the addresses as a slice.
    pub fn as_slice(&self) -> &[String] {
        &self.addrs
    }

    /// Consume into the underlying vector.
    pub fn into_vec(self) -> Vec<String> {
        self.addrs
    }
}

impl From<Vec<String>> for PeerSet {
    fn from(addrs: Vec<String>) -> Self {
        let mut set = PeerSet::new();
        set.extend(addrs);
        set
    }
}

impl From<PeerSet> for Vec<String> {
    fn from(set: PeerSet) -> Self {
        set.addrs
    }
}

impl<S: Into<String>> FromIterator<S> for PeerSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = PeerSet::new();
        set.extend(iter);
        set
    }
}

impl<'a> IntoIterator for &'a PeerSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.iter()
    }
}
