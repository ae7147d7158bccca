//! Append-only store of confirmed-live addresses.
//!
//! Insertion order is kept for persistence, a hash set answers membership, and
//! a running SHA-256 over the records lets checkpoints fingerprint the corpus
//! without rehashing it.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use v6seek_common::network::Address;

#[derive(Clone)]
pub struct AddressCorpus {
    order: Vec<Address>,
    members: HashSet<Address>,
    hasher: Sha256,
}

impl Default for AddressCorpus {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressCorpus {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            members: HashSet::new(),
            hasher: Sha256::new(),
        }
    }

    /// Builds a corpus from records in order, skipping repeats.
    ///
    /// Returns the corpus and the number of duplicates dropped.
    pub fn from_records(records: impl IntoIterator<Item = Address>) -> (Self, usize) {
        let mut corpus = Self::new();
        let mut duplicates = 0;
        for addr in records {
            if !corpus.insert(addr) {
                duplicates += 1;
            }
        }
        (corpus, duplicates)
    }

    /// Returns `false` if the address was already present.
    pub fn insert(&mut self, addr: Address) -> bool {
        if !self.members.insert(addr) {
            return false;
        }
        self.hasher.update(addr.as_bytes());
        self.order.push(addr);
        true
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.members.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn as_slice(&self) -> &[Address] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.order.iter()
    }

    /// Hex SHA-256 over every record in insertion order.
    pub fn checksum(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Explicit rebuild: keeps only addresses matching `keep`, preserving order.
    ///
    /// Returns the removed addresses.
    pub fn rebuild_retaining<F>(&mut self, mut keep: F) -> Vec<Address>
    where
        F: FnMut(&Address) -> bool,
    {
        let (kept, removed): (Vec<Address>, Vec<Address>) =
            self.order.drain(..).partition(|addr| keep(addr));
        *self = Self::from_records(kept).0;
        removed
    }
}

/// Hex SHA-256 over a record sequence, matching [`AddressCorpus::checksum`].
pub fn records_checksum(records: &[Address]) -> String {
    let mut hasher = Sha256::new();
    for addr in records {
        hasher.update(addr.as_bytes());
    }
    hex::encode(hasher.finalize())
}
