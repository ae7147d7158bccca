//! Per-prefix aggregates over the corpus.
//!
//! Each cluster counts its hosts and, for every nibble position not fixed by
//! the prefix, how often each of the 16 values was observed. Clusters are kept
//! in a `BTreeMap` so iteration order (and therefore sampling) is stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use v6seek_common::network::address::NIBBLES;
use v6seek_common::network::{Address, NetworkPrefix};

use crate::corpus::AddressCorpus;

pub const NIBBLE_VALUES: usize = 16;

/// Observation counts for the 16 values of one nibble position.
pub type NibbleCounts = [u32; NIBBLE_VALUES];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub host_count: u32,
    /// Indexed by `position - fixed_nibbles`.
    pub nibble_counts: Vec<NibbleCounts>,
}

impl ClusterStats {
    fn new(free_positions: usize) -> Self {
        Self {
            host_count: 0,
            nibble_counts: vec![[0; NIBBLE_VALUES]; free_positions],
        }
    }

    fn observe(&mut self, addr: &Address, fixed: usize) {
        self.host_count = self.host_count.saturating_add(1);
        for (offset, counts) in self.nibble_counts.iter_mut().enumerate() {
            let value = addr.nibble(fixed + offset) as usize;
            counts[value] = counts[value].saturating_add(1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterRegistry {
    prefix_len: u8,
    clusters: BTreeMap<NetworkPrefix, ClusterStats>,
}

impl ClusterRegistry {
    pub fn new(prefix_len: u8) -> Self {
        Self {
            prefix_len,
            clusters: BTreeMap::new(),
        }
    }

    pub fn build(prefix_len: u8, corpus: &AddressCorpus) -> Self {
        let mut registry = Self::new(prefix_len);
        for addr in corpus.iter() {
            registry.observe(addr);
        }
        registry
    }

    /// Folds one newly merged address into its cluster.
    pub fn observe(&mut self, addr: &Address) {
        let prefix = addr.prefix(self.prefix_len);
        let fixed = prefix.fixed_nibbles();
        self.clusters
            .entry(prefix)
            .or_insert_with(|| ClusterStats::new(NIBBLES - fixed))
            .observe(addr, fixed);
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn get(&self, prefix: &NetworkPrefix) -> Option<&ClusterStats> {
        self.clusters.get(prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NetworkPrefix, &ClusterStats)> {
        self.clusters.iter()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn total_hosts(&self) -> u64 {
        self.clusters.values().map(|c| c.host_count as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(addrs: &[&str]) -> AddressCorpus {
        AddressCorpus::from_records(addrs.iter().map(|s| s.parse().unwrap())).0
    }

    #[test]
    fn groups_by_prefix() {
        let corpus = corpus(&["2001:db8::1", "2001:db8::2", "2001:db8:0:1::1"]);
        let registry = ClusterRegistry::build(64, &corpus);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.total_hosts(), 3);

        let prefix = "2001:db8::".parse::<Address>().unwrap().prefix(64);
        let stats = registry.get(&prefix).unwrap();
        assert_eq!(stats.host_count, 2);
        assert_eq!(stats.nibble_counts.len(), 16);
    }

    #[test]
    fn counts_free_nibbles_only() {
        let corpus = corpus(&["2001:db8::1", "2001:db8::2"]);
        let registry = ClusterRegistry::build(64, &corpus);
        let prefix = "2001:db8::".parse::<Address>().unwrap().prefix(64);
        let stats = registry.get(&prefix).unwrap();

        // last nibble position is offset 15 after a /64
        assert_eq!(stats.nibble_counts[15][1], 1);
        assert_eq!(stats.nibble_counts[15][2], 1);
        assert_eq!(stats.nibble_counts[0][0], 2);
    }

    #[test]
    fn incremental_matches_rebuild() {
        let all = corpus(&["2001:db8::1", "2001:db8:1::1", "2001:db8::ff"]);
        let mut incremental = ClusterRegistry::new(48);
        for addr in all.iter() {
            incremental.observe(addr);
        }
        let rebuilt = ClusterRegistry::build(48, &all);
        let a: Vec<_> = incremental.iter().collect();
        let b: Vec<_> = rebuilt.iter().collect();
        assert_eq!(a, b);
    }
}
