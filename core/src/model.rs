//! # Probabilistic Address Model
//!
//! A trained snapshot of nibble frequencies over the corpus:
//!
//! * a **global** table, one distribution per nibble position;
//! * one **cluster table** per network prefix, holding the distributions of the
//!   positions the prefix leaves free. Clusters with fewer than
//!   `min_cluster_size` hosts carry no local table and fall back to the global
//!   distributions for those positions.
//!
//! Snapshots are immutable. Retraining builds a new [`AddressModel`] with a
//! higher version, tagged with the checksum of the corpus it was built from.

mod sampler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use v6seek_common::config::ModelConfig;
use v6seek_common::network::NetworkPrefix;
use v6seek_common::network::address::NIBBLES;

use crate::cluster::{ClusterRegistry, NIBBLE_VALUES, NibbleCounts};
use crate::corpus::AddressCorpus;

pub use sampler::{Batch, CandidateStream, Exclusion, GenerationRequest, mix};

/// Training knobs that shape a snapshot. A snapshot trained with different
/// parameters is never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub prefix_len: u8,
    pub min_cluster_size: u32,
    pub smoothing: f64,
    pub density_exponent: f64,
}

impl From<&ModelConfig> for ModelParams {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            prefix_len: cfg.prefix_len,
            min_cluster_size: cfg.min_cluster_size,
            smoothing: cfg.smoothing,
            density_exponent: cfg.density_exponent,
        }
    }
}

impl Default for ModelParams {
    fn default() -> Self {
        Self::from(&ModelConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTable {
    pub prefix: NetworkPrefix,
    pub host_count: u32,
    /// `None` when the cluster is too sparse and samples from the global table.
    pub local: Option<Vec<NibbleCounts>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressModel {
    version: u64,
    corpus_checksum: String,
    corpus_len: u64,
    trained_at: DateTime<Utc>,
    params: ModelParams,
    global: Vec<NibbleCounts>,
    clusters: Vec<ClusterTable>,
}

impl AddressModel {
    /// Trains a new snapshot from the corpus and its cluster aggregates.
    ///
    /// If `clusters` was built at a different prefix length than `params`
    /// asks for, it is rebuilt from the corpus first.
    pub fn train(
        version: u64,
        corpus: &AddressCorpus,
        clusters: &ClusterRegistry,
        params: &ModelParams,
    ) -> Self {
        let rebuilt;
        let clusters = if clusters.prefix_len() == params.prefix_len {
            clusters
        } else {
            rebuilt = ClusterRegistry::build(params.prefix_len, corpus);
            &rebuilt
        };

        let mut global = vec![[0u32; NIBBLE_VALUES]; NIBBLES];
        for addr in corpus.iter() {
            for (pos, counts) in global.iter_mut().enumerate() {
                let value = addr.nibble(pos) as usize;
                counts[value] = counts[value].saturating_add(1);
            }
        }

        let clusters = clusters
            .iter()
            .map(|(prefix, stats)| ClusterTable {
                prefix: *prefix,
                host_count: stats.host_count,
                local: (stats.host_count >= params.min_cluster_size)
                    .then(|| stats.nibble_counts.clone()),
            })
            .collect();

        Self {
            version,
            corpus_checksum: corpus.checksum(),
            corpus_len: corpus.len() as u64,
            trained_at: Utc::now(),
            params: params.clone(),
            global,
            clusters,
        }
    }

    /// True when the snapshot was trained on exactly this corpus.
    pub fn is_current_for(&self, corpus: &AddressCorpus) -> bool {
        self.corpus_len == corpus.len() as u64 && self.corpus_checksum == corpus.checksum()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn global(&self) -> &[NibbleCounts] {
        &self.global
    }

    pub fn clusters(&self) -> &[ClusterTable] {
        &self.clusters
    }

    /// Clusters dense enough to use their own distributions.
    pub fn local_cluster_count(&self) -> usize {
        self.clusters.iter().filter(|c| c.local.is_some()).count()
    }

    /// Sampling weight of a cluster: `host_count ^ density_exponent`.
    pub fn cluster_weight(&self, table: &ClusterTable) -> f64 {
        (table.host_count as f64).powf(self.params.density_exponent)
    }
}
