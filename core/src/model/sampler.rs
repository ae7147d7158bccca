//! Candidate generation from a trained [`AddressModel`].
//!
//! A candidate is built by picking a cluster (weighted by host density),
//! copying its fixed prefix nibbles and drawing each free nibble from the
//! cluster's distribution, or the global one for sparse clusters. Draws that
//! hit the corpus, the blacklist or an earlier candidate are rejected and
//! redrawn until the attempt budget runs out.

use std::collections::HashSet;

use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use v6seek_common::network::Address;
use v6seek_common::network::address::NIBBLES;

use super::AddressModel;
use crate::blacklist::BlacklistRegistry;
use crate::cluster::{NIBBLE_VALUES, NibbleCounts};
use crate::corpus::AddressCorpus;

/// Read-only view of everything a candidate must avoid.
#[derive(Clone, Copy)]
pub struct Exclusion<'a> {
    pub corpus: &'a AddressCorpus,
    pub blacklist: &'a BlacklistRegistry,
}

impl<'a> Exclusion<'a> {
    pub fn new(corpus: &'a AddressCorpus, blacklist: &'a BlacklistRegistry) -> Self {
        Self { corpus, blacklist }
    }

    pub fn admits(&self, addr: &Address) -> bool {
        !self.corpus.contains(addr) && !self.blacklist.contains(addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRequest {
    pub count: usize,
    pub seed: u64,
    /// Draws allowed per requested candidate before giving up.
    pub attempts_per_candidate: usize,
}

impl GenerationRequest {
    pub fn max_attempts(&self) -> usize {
        self.count.saturating_mul(self.attempts_per_candidate)
    }
}

/// Result of one generation pass. Falling short of `requested` is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub addresses: Vec<Address>,
    pub requested: usize,
    pub attempts: usize,
}

impl Batch {
    fn empty(requested: usize) -> Self {
        Self {
            addresses: Vec::new(),
            requested,
            attempts: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.addresses.len())
    }

    pub fn is_short(&self) -> bool {
        self.shortfall() > 0
    }
}

/// SplitMix64 finaliser over `seed` and `salt`. Used to derive independent
/// seeds for iterations and cluster workers.
pub fn mix(seed: u64, salt: u64) -> u64 {
    let mut z = seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, Copy)]
struct PositionTable {
    cumulative: [f64; NIBBLE_VALUES],
}

impl PositionTable {
    fn new(counts: &NibbleCounts, smoothing: f64) -> Self {
        let mut cumulative = [0.0; NIBBLE_VALUES];
        let mut acc = 0.0;
        for (slot, count) in cumulative.iter_mut().zip(counts) {
            acc += *count as f64 + smoothing;
            *slot = acc;
        }
        if acc <= 0.0 {
            for (value, slot) in cumulative.iter_mut().enumerate() {
                *slot = (value + 1) as f64;
            }
        }
        Self { cumulative }
    }

    fn draw<R: Rng>(&self, rng: &mut R) -> u8 {
        let total = self.cumulative[NIBBLE_VALUES - 1];
        let point = rng.random::<f64>() * total;
        self.cumulative
            .iter()
            .position(|edge| point < *edge)
            .unwrap_or(NIBBLE_VALUES - 1) as u8
    }
}

struct CompiledCluster {
    base: [u8; NIBBLES],
    fixed: usize,
    tables: Vec<PositionTable>,
}

impl CompiledCluster {
    fn draw<R: Rng>(&self, rng: &mut R) -> Address {
        let mut nibbles = self.base;
        for (offset, table) in self.tables.iter().enumerate() {
            nibbles[self.fixed + offset] = table.draw(rng);
        }
        Address::from_nibbles(&nibbles)
    }
}

/// Sampling tables compiled from a snapshot. Owns its data, so it can outlive
/// the borrow of the model and be shared across workers.
struct Sampler {
    clusters: Vec<CompiledCluster>,
    picker: Option<WeightedIndex<f64>>,
}

impl Sampler {
    fn new(model: &AddressModel) -> Self {
        let smoothing = model.params.smoothing;
        let global: Vec<PositionTable> = model
            .global
            .iter()
            .map(|counts| PositionTable::new(counts, smoothing))
            .collect();

        let clusters: Vec<CompiledCluster> = model
            .clusters
            .iter()
            .map(|table| {
                let fixed = table.prefix.fixed_nibbles();
                let tables = match &table.local {
                    Some(local) => local
                        .iter()
                        .map(|counts| PositionTable::new(counts, smoothing))
                        .collect(),
                    None => global[fixed..].to_vec(),
                };
                CompiledCluster {
                    base: table.prefix.network().nibbles(),
                    fixed,
                    tables,
                }
            })
            .collect();

        let picker = WeightedIndex::new(model.clusters.iter().map(|t| model.cluster_weight(t))).ok();
        Self { clusters, picker }
    }

    fn pick<R: Rng>(&self, rng: &mut R) -> Option<&CompiledCluster> {
        let picker = self.picker.as_ref()?;
        self.clusters.get(picker.sample(rng))
    }
}

/// Lazy, finite candidate sequence. Each call to [`AddressModel::candidates`]
/// starts a fresh stream; a stream cannot be resumed.
pub struct CandidateStream<'a> {
    sampler: Sampler,
    exclusion: Exclusion<'a>,
    rng: StdRng,
    seen: HashSet<Address>,
    remaining: usize,
    attempts_left: usize,
}

impl Iterator for CandidateStream<'_> {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        while self.remaining > 0 && self.attempts_left > 0 {
            self.attempts_left -= 1;
            let addr = self.sampler.pick(&mut self.rng)?.draw(&mut self.rng);
            if self.exclusion.admits(&addr) && self.seen.insert(addr) {
                self.remaining -= 1;
                return Some(addr);
            }
        }
        None
    }
}

/// Per-cluster sampling state carried across generation rounds.
struct ClusterWorker {
    rng: StdRng,
    seen: HashSet<Address>,
    found: Vec<Address>,
    stalled: bool,
}

impl ClusterWorker {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seen: HashSet::new(),
            found: Vec::new(),
            stalled: false,
        }
    }

    /// Draws until `quota` new candidates are found or `budget` draws are
    /// spent. Returns `(added, attempts)`.
    fn fill(
        &mut self,
        cluster: &CompiledCluster,
        quota: usize,
        budget: usize,
        exclusion: &Exclusion<'_>,
    ) -> (usize, usize) {
        let mut added = 0;
        let mut attempts = 0;
        while added < quota && attempts < budget {
            attempts += 1;
            let addr = cluster.draw(&mut self.rng);
            if exclusion.admits(&addr) && self.seen.insert(addr) {
                self.found.push(addr);
                added += 1;
            }
        }
        if added < quota {
            self.stalled = true;
        }
        (added, attempts)
    }
}

impl AddressModel {
    /// Sequential generator drawing clusters one candidate at a time.
    pub fn candidates<'a>(
        &self,
        request: &GenerationRequest,
        exclusion: Exclusion<'a>,
    ) -> CandidateStream<'a> {
        CandidateStream {
            sampler: Sampler::new(self),
            exclusion,
            rng: StdRng::seed_from_u64(request.seed),
            seen: HashSet::new(),
            remaining: request.count,
            attempts_left: request.max_attempts(),
        }
    }

    /// Generates a batch with one worker per cluster.
    ///
    /// The requested count is split across clusters by weighted draws from a
    /// master RNG; each worker then samples its quota with its own RNG and
    /// attempt budget. A worker that cannot fill its quota is stalled, and the
    /// unfilled part is redrawn over the remaining clusters until the batch is
    /// full or the batch attempt bound is spent. Worker output is merged in
    /// cluster order through one dedup pass, so the result depends only on the
    /// model and the seed.
    pub fn generate(&self, request: &GenerationRequest, exclusion: &Exclusion<'_>) -> Batch {
        let sampler = Sampler::new(self);
        if sampler.picker.is_none() {
            return Batch::empty(request.count);
        }
        if request.count == 0 {
            return Batch::empty(0);
        }

        let weights: Vec<f64> = self.clusters.iter().map(|t| self.cluster_weight(t)).collect();
        let mut workers: Vec<ClusterWorker> = (0..sampler.clusters.len())
            .map(|idx| ClusterWorker::new(mix(request.seed, idx as u64)))
            .collect();
        let mut master = StdRng::seed_from_u64(request.seed);
        let max_attempts = request.max_attempts();
        let mut attempts = 0;
        let mut accepted = 0;

        while accepted < request.count && attempts < max_attempts {
            let active = workers
                .iter()
                .zip(&weights)
                .map(|(worker, weight)| if worker.stalled { 0.0 } else { *weight });
            let Ok(picker) = WeightedIndex::new(active) else {
                break;
            };

            let wanted = request.count - accepted;
            let mut quotas = vec![0usize; workers.len()];
            for _ in 0..wanted {
                quotas[picker.sample(&mut master)] += 1;
            }

            // Later rounds share what is left of the batch bound.
            let mut left = max_attempts - attempts;
            let per_candidate = request.attempts_per_candidate.min(left / wanted).max(1);
            let budgets: Vec<usize> = quotas
                .iter()
                .map(|quota| {
                    let budget = quota.saturating_mul(per_candidate).min(left);
                    left -= budget;
                    budget
                })
                .collect();

            let round: Vec<(usize, usize)> = workers
                .par_iter_mut()
                .zip(quotas.par_iter().zip(budgets.par_iter()))
                .enumerate()
                .filter(|(_, (_, (quota, budget)))| **quota > 0 && **budget > 0)
                .map(|(idx, (worker, (quota, budget)))| {
                    worker.fill(&sampler.clusters[idx], *quota, *budget, exclusion)
                })
                .collect();

            let used: usize = round.iter().map(|(_, used)| used).sum();
            if used == 0 {
                break;
            }
            attempts += used;
            accepted += round.iter().map(|(added, _)| added).sum::<usize>();
        }

        let mut seen = HashSet::with_capacity(request.count);
        let mut batch = Batch::empty(request.count);
        batch.attempts = attempts;
        for worker in workers {
            batch
                .addresses
                .extend(worker.found.into_iter().filter(|addr| seen.insert(*addr)));
        }
        batch.addresses.truncate(request.count);
        batch
    }
}
