//! The discovery loop.
//!
//! [`StateMachine`] owns the corpus, the cluster aggregates and the current
//! model, and moves through the phases one [`step`](StateMachine::step) at a
//! time:
//!
//! ```text
//! INIT -> SEED_SCAN -> MERGE -> CHECKPOINT -> TRAIN -> GENERATE -> SCAN -> MERGE -> CHECKPOINT -> ...
//! ```
//!
//! Only CHECKPOINT makes progress durable. A crash anywhere else resumes from
//! the last checkpoint; corpus records appended by a merge that never reached
//! its checkpoint are recovered on INIT rather than probed again.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use v6seek_common::config::Config;
use v6seek_common::network::Address;

use crate::blacklist::{BlacklistError, BlacklistRegistry};
use crate::cluster::ClusterRegistry;
use crate::corpus::{AddressCorpus, records_checksum};
use crate::model::{AddressModel, Exclusion, GenerationRequest, ModelParams, mix};
use crate::persistence::{ModelRef, PersistenceError, StateFile, Store};
use crate::prober::ProbeRunner;
use crate::seed::{self, SeedError};

pub mod state;

pub use state::{Phase, PipelineState, StopReason};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Blacklist(#[from] BlacklistError),
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error("prober unavailable: {0}")]
    ProberUnavailable(String),
    #[error("seed scan produced no live addresses, the corpus cannot be bootstrapped")]
    EmptySeed,
    #[error("scan aborted {0} times in a row")]
    ScanExhausted(u32),
    #[error("failed to start generation workers: {0}")]
    Workers(String),
}

impl PipelineError {
    /// Fatal errors need operator attention; the rest resume on the next run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::ScanExhausted(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub attempts_per_candidate: usize,
    /// 0 means unlimited.
    pub max_iterations: u64,
    pub convergence_window: u32,
    pub max_scan_aborts: u32,
    pub workers: usize,
    pub model: ModelParams,
    /// Base RNG seed for a fresh run. Resumed runs keep their persisted seed.
    pub seed: Option<u64>,
}

impl From<&Config> for PipelineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.pipeline.batch_size,
            attempts_per_candidate: cfg.pipeline.attempts_per_candidate,
            max_iterations: cfg.pipeline.max_iterations,
            convergence_window: cfg.pipeline.convergence_window,
            max_scan_aborts: cfg.pipeline.max_scan_aborts,
            workers: cfg.pipeline.workers,
            model: ModelParams::from(&cfg.model),
            seed: cfg.model.seed,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Where SEED_SCAN gets its addresses.
#[derive(Debug, Clone)]
pub enum SeedSource {
    File(PathBuf),
    List(Vec<Address>),
}

impl SeedSource {
    fn load(&self) -> Result<Vec<Address>, SeedError> {
        match self {
            SeedSource::File(path) => seed::load_hitlist(path),
            SeedSource::List(addrs) => Ok(addrs.clone()),
        }
    }
}

/// Emitted after every executed phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub next: Phase,
    pub iteration: u64,
    pub corpus_len: usize,
    /// Candidates (or seeds) waiting to be scanned.
    pub pending: usize,
    /// Addresses added to the corpus by this phase.
    pub added: usize,
}

pub type PhaseHook = Box<dyn Fn(&PhaseReport) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub corpus_len: usize,
    pub model_version: u64,
    pub total_candidates: u64,
    pub total_hits: u64,
    pub stop_reason: Option<StopReason>,
}

pub struct StateMachine {
    settings: PipelineSettings,
    store: Store,
    runner: ProbeRunner,
    blacklist: Arc<BlacklistRegistry>,
    seeds: SeedSource,
    cancel: Arc<AtomicBool>,
    hook: Option<PhaseHook>,
    pool: Option<rayon::ThreadPool>,

    state: PipelineState,
    /// In-memory copy of the last committed state.
    committed: Option<PipelineState>,
    corpus: AddressCorpus,
    clusters: ClusterRegistry,
    model: Option<AddressModel>,
    model_ref: Option<ModelRef>,
    model_dirty: bool,

    batch: Vec<Address>,
    hits: Vec<Address>,
    closes_iteration: bool,
    scan_aborts: u32,
    trace: Vec<Phase>,
}

impl StateMachine {
    pub fn new(
        settings: PipelineSettings,
        store: Store,
        runner: ProbeRunner,
        blacklist: Arc<BlacklistRegistry>,
        seeds: SeedSource,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, PipelineError> {
        let pool = match settings.workers {
            0 => None,
            n => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("v6seek-gen-{i}"))
                    .build()
                    .map_err(|e| PipelineError::Workers(e.to_string()))?,
            ),
        };
        let clusters = ClusterRegistry::new(settings.model.prefix_len);

        Ok(Self {
            settings,
            store,
            runner,
            blacklist,
            seeds,
            cancel,
            hook: None,
            pool,
            state: PipelineState::fresh(0),
            committed: None,
            corpus: AddressCorpus::new(),
            clusters,
            model: None,
            model_ref: None,
            model_dirty: false,
            batch: Vec::new(),
            hits: Vec::new(),
            closes_iteration: false,
            scan_aborts: 0,
            trace: Vec::new(),
        })
    }

    pub fn with_hook(mut self, hook: PhaseHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn corpus(&self) -> &AddressCorpus {
        &self.corpus
    }

    pub fn clusters(&self) -> &ClusterRegistry {
        &self.clusters
    }

    pub fn model(&self) -> Option<&AddressModel> {
        self.model.as_ref()
    }

    /// Every phase executed so far, in order.
    pub fn trace(&self) -> &[Phase] {
        &self.trace
    }

    /// Confirms the prober backend can run before any phase executes.
    pub fn preflight(&self) -> Result<(), PipelineError> {
        match self.runner.check_available() {
            Ok(true) => Ok(()),
            Ok(false) => Err(PipelineError::ProberUnavailable(
                "scanner executable not found".to_string(),
            )),
            Err(e) => Err(PipelineError::ProberUnavailable(e.to_string())),
        }
    }

    /// Steps until TERMINAL or an error.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        while self.state.phase != Phase::Terminal {
            self.step()?;
        }
        Ok(self.summary())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            iterations: self.state.iteration,
            corpus_len: self.corpus.len(),
            model_version: self.state.model_version,
            total_candidates: self.state.total_candidates,
            total_hits: self.state.total_hits,
            stop_reason: self.state.stop_reason,
        }
    }

    /// Executes the current phase and returns the next one.
    ///
    /// Any error leaves the machine in TERMINAL; the state file keeps the
    /// last checkpoint.
    pub fn step(&mut self) -> Result<Phase, PipelineError> {
        let phase = self.state.phase;
        if phase == Phase::Terminal {
            return Ok(phase);
        }

        let before = self.corpus.len();
        let result = if self.cancel_requested(phase) {
            Ok(self.cancel())
        } else {
            match phase {
                Phase::Init => self.init(),
                Phase::SeedScan => self.seed_scan(),
                Phase::Train => Ok(self.train()),
                Phase::Generate => Ok(self.generate()),
                Phase::Scan => self.scan(),
                Phase::Merge => self.merge(),
                Phase::Checkpoint => self.checkpoint(),
                Phase::Terminal => Ok(Phase::Terminal),
            }
        };

        self.trace.push(phase);
        let next = match result {
            Ok(next) => next,
            Err(err) => {
                self.state.phase = Phase::Terminal;
                return Err(err);
            }
        };
        self.state.phase = next;

        if let Some(hook) = &self.hook {
            hook(&PhaseReport {
                phase,
                next,
                iteration: self.state.iteration,
                corpus_len: self.corpus.len(),
                pending: self.batch.len(),
                added: self.corpus.len().saturating_sub(before),
            });
        }
        Ok(next)
    }

    /// Cancellation is honoured before phases that start new work. Pending
    /// hits still get merged and checkpointed.
    fn cancel_requested(&self, phase: Phase) -> bool {
        matches!(
            phase,
            Phase::SeedScan | Phase::Train | Phase::Generate | Phase::Scan
        ) && self.cancel.load(Ordering::SeqCst)
    }

    fn cancel(&mut self) -> Phase {
        if !self.batch.is_empty() {
            info!("Discarding {} unscanned candidates", self.batch.len());
            self.batch.clear();
        }
        info!("Shutdown requested, stopping at phase boundary");
        self.state.stop_reason = Some(StopReason::Cancelled);
        Phase::Terminal
    }

    fn init(&mut self) -> Result<Phase, PipelineError> {
        let log = self.store.corpus_log();
        let contents = log.read_all()?;
        if contents.trailing_bytes > 0 {
            warn!(
                "Dropping {} bytes of a partially written corpus record",
                contents.trailing_bytes
            );
            log.truncate_to(contents.records.len())?;
        }
        let records = contents.records;

        let Some(file) = self.store.load()? else {
            return self.init_fresh(records);
        };
        self.init_resume(file, records)
    }

    fn init_fresh(&mut self, records: Vec<Address>) -> Result<Phase, PipelineError> {
        let seed = self.settings.seed.unwrap_or_else(rand::random);
        self.state = PipelineState::fresh(seed);
        info!("Starting a new run (seed {seed})");

        if records.is_empty() {
            return Ok(Phase::SeedScan);
        }

        // A seed merge reached the log but never its first checkpoint.
        let (mut corpus, duplicates) = AddressCorpus::from_records(records);
        let pruned = corpus.rebuild_retaining(|addr| !self.blacklist.contains(addr));
        if duplicates > 0 || !pruned.is_empty() {
            warn!(
                "Corpus log had {duplicates} duplicate and {} blacklisted records",
                pruned.len()
            );
            self.store.corpus_log().rewrite(corpus.as_slice())?;
        }
        self.install_corpus(corpus);

        if self.corpus.is_empty() {
            return Ok(Phase::SeedScan);
        }
        info!(
            "Recovered {} corpus records written before the first checkpoint",
            self.corpus.len()
        );
        Ok(Phase::Checkpoint)
    }

    fn init_resume(&mut self, file: StateFile, records: Vec<Address>) -> Result<Phase, PipelineError> {
        let checkpointed = usize::try_from(file.corpus.records).unwrap_or(usize::MAX);
        let blacklist_changed = file.blacklist_fingerprint != self.blacklist.fingerprint();

        if !blacklist_changed {
            if records.len() < checkpointed {
                return Err(PersistenceError::Corrupt(format!(
                    "{} records on disk, checkpoint expects {checkpointed}",
                    records.len()
                ))
                .into());
            }
            if records_checksum(&records[..checkpointed]) != file.corpus.checksum {
                return Err(PersistenceError::Corrupt(
                    "checksum mismatch over checkpointed records".to_string(),
                )
                .into());
            }
        }

        let recovered = records.len().saturating_sub(checkpointed);
        let (mut corpus, duplicates) = AddressCorpus::from_records(records);
        let mut pruned = Vec::new();
        if blacklist_changed {
            info!("Blacklist changed since the last checkpoint, pruning corpus");
            pruned = corpus.rebuild_retaining(|addr| !self.blacklist.contains(addr));
            info!("Removed {} blacklisted addresses from the corpus", pruned.len());
        }
        if duplicates > 0 {
            warn!("Corpus log had {duplicates} duplicate records");
        }
        let rewrite = duplicates > 0 || !pruned.is_empty();
        if rewrite {
            self.store.corpus_log().rewrite(corpus.as_slice())?;
        }

        self.state = file.state;
        self.state.stop_reason = None;
        self.committed = Some(self.state.clone());
        self.install_corpus(corpus);

        if !blacklist_changed {
            if let Some(model_ref) = &file.model {
                self.model = self.store.load_model(model_ref);
                self.model_ref = self.model.as_ref().map(|_| model_ref.clone());
                if let Some(model) = &self.model {
                    debug!(
                        "Loaded model snapshot v{} trained at {}",
                        model.version(),
                        model.trained_at().to_rfc3339()
                    );
                }
            }
        }
        if let Some(model) = &self.model {
            if model.params() != &self.settings.model {
                info!("Model parameters changed, discarding snapshot v{}", model.version());
                self.model = None;
                self.model_ref = None;
            }
        }

        info!(
            "Resuming at iteration {} with {} corpus records",
            self.state.iteration,
            self.corpus.len()
        );

        if self.corpus.is_empty() {
            return Ok(Phase::SeedScan);
        }
        if recovered > 0 {
            // The lost batch's candidate count is gone, so its hits stay out
            // of the totals as well.
            info!("Recovered {recovered} addresses merged after the last checkpoint");
            self.closes_iteration = true;
            return Ok(Phase::Checkpoint);
        }
        if blacklist_changed || rewrite {
            return Ok(Phase::Checkpoint);
        }
        Ok(self.next_after_checkpoint())
    }

    fn install_corpus(&mut self, corpus: AddressCorpus) {
        self.clusters = ClusterRegistry::build(self.settings.model.prefix_len, &corpus);
        self.corpus = corpus;
    }

    fn seed_scan(&mut self) -> Result<Phase, PipelineError> {
        let mut seeds = self.seeds.load()?;
        let dropped = self.blacklist.retain_allowed(&mut seeds);
        if dropped > 0 {
            info!("Removed {dropped} blacklisted seeds");
        }
        seeds.retain(|addr| !self.corpus.contains(addr));
        if seeds.is_empty() {
            return Err(PipelineError::EmptySeed);
        }

        info!("Probing {} seed addresses", seeds.len());
        match self.runner.probe(&seeds) {
            Ok(outcome) => {
                self.scan_aborts = 0;
                if outcome.live.is_empty() {
                    return Err(PipelineError::EmptySeed);
                }
                info!("{} of {} seeds are live", outcome.live.len(), seeds.len());
                self.hits = outcome.live;
                self.closes_iteration = false;
                Ok(Phase::Merge)
            }
            Err(aborted) => {
                warn!("Seed scan aborted: {aborted}");
                self.record_abort()?;
                Ok(Phase::SeedScan)
            }
        }
    }

    fn train(&mut self) -> Phase {
        let params = &self.settings.model;
        let reusable = self
            .model
            .as_ref()
            .is_some_and(|m| m.params() == params && m.is_current_for(&self.corpus));
        if reusable {
            debug!("Model is current for the corpus, reusing it");
            return Phase::Generate;
        }

        let previous = self.model.as_ref().map_or(0, AddressModel::version);
        let version = self.state.model_version.max(previous) + 1;
        let model = AddressModel::train(version, &self.corpus, &self.clusters, params);
        info!(
            "Trained model v{version}: {} clusters ({} with local statistics) over {} addresses",
            model.clusters().len(),
            model.local_cluster_count(),
            self.corpus.len()
        );
        self.model = Some(model);
        self.model_dirty = true;
        Phase::Generate
    }

    fn generate(&mut self) -> Phase {
        let request = GenerationRequest {
            count: self.settings.batch_size,
            seed: mix(self.state.seed, self.state.iteration),
            attempts_per_candidate: self.settings.attempts_per_candidate,
        };

        let batch = match &self.model {
            Some(model) => {
                let exclusion = Exclusion::new(&self.corpus, &self.blacklist);
                match &self.pool {
                    Some(pool) => pool.install(|| model.generate(&request, &exclusion)),
                    None => model.generate(&request, &exclusion),
                }
            }
            None => Default::default(),
        };

        if batch.is_short() {
            self.state.stalled_generations += 1;
            info!(
                "Generated {} of {} candidates ({} short generation(s) in a row)",
                batch.len(),
                batch.requested,
                self.state.stalled_generations
            );
        } else {
            self.state.stalled_generations = 0;
            info!("Generated {} candidates", batch.len());
        }
        self.state.total_candidates += batch.len() as u64;
        self.closes_iteration = true;

        if batch.is_empty() {
            return Phase::Checkpoint;
        }
        self.batch = batch.addresses;
        Phase::Scan
    }

    fn scan(&mut self) -> Result<Phase, PipelineError> {
        let batch = std::mem::take(&mut self.batch);
        match self.runner.probe(&batch) {
            Ok(outcome) => {
                self.scan_aborts = 0;
                info!(
                    "Scan finished: {} of {} candidates responded",
                    outcome.live.len(),
                    outcome.submitted
                );
                self.hits = outcome.live;
                Ok(Phase::Merge)
            }
            Err(aborted) => {
                warn!("Scan aborted, discarding {} candidates: {aborted}", batch.len());
                self.record_abort()?;
                if let Some(committed) = &self.committed {
                    self.state = committed.clone();
                    self.state.stop_reason = None;
                }
                self.closes_iteration = false;
                Ok(Phase::Train)
            }
        }
    }

    fn record_abort(&mut self) -> Result<(), PipelineError> {
        self.scan_aborts += 1;
        if self.scan_aborts >= self.settings.max_scan_aborts {
            return Err(PipelineError::ScanExhausted(self.scan_aborts));
        }
        Ok(())
    }

    fn merge(&mut self) -> Result<Phase, PipelineError> {
        let hits = std::mem::take(&mut self.hits);
        let mut fresh = Vec::with_capacity(hits.len());
        for addr in hits {
            if self.blacklist.contains(&addr) {
                continue;
            }
            if self.corpus.insert(addr) {
                self.clusters.observe(&addr);
                fresh.push(addr);
            }
        }
        self.store.corpus_log().append(&fresh)?;
        if self.closes_iteration {
            self.state.total_hits += fresh.len() as u64;
        }
        info!(
            "Merged {} new addresses, corpus now holds {}",
            fresh.len(),
            self.corpus.len()
        );
        Ok(Phase::Checkpoint)
    }

    fn checkpoint(&mut self) -> Result<Phase, PipelineError> {
        if std::mem::take(&mut self.closes_iteration) {
            self.state.iteration += 1;
        }
        if let Some(model) = &self.model {
            if self.model_dirty {
                self.model_ref = Some(self.store.save_model(model)?);
                self.model_dirty = false;
            }
            self.state.model_version = model.version();
        }

        self.state.corpus_len = self.corpus.len() as u64;
        let next = self.next_after_checkpoint();
        self.state.phase = next;
        let now = Utc::now();
        self.state.updated_at = now;
        self.state.last_checkpoint_at = Some(now);

        let corpus_ref = self.store.corpus_ref(&self.corpus);
        self.store.save(
            &self.state,
            &corpus_ref,
            self.model_ref.as_ref(),
            self.blacklist.fingerprint(),
        )?;
        self.committed = Some(self.state.clone());
        debug!(
            "Checkpoint committed: iteration {}, {} records, model v{}",
            self.state.iteration, self.state.corpus_len, self.state.model_version
        );
        Ok(next)
    }

    /// TRAIN, or TERMINAL when a stop condition holds.
    fn next_after_checkpoint(&mut self) -> Phase {
        let reason = if self.settings.max_iterations > 0
            && self.state.iteration >= self.settings.max_iterations
        {
            Some(StopReason::IterationCap)
        } else if self.state.stalled_generations >= self.settings.convergence_window {
            Some(StopReason::Converged)
        } else if self.cancel.load(Ordering::SeqCst) {
            Some(StopReason::Cancelled)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                info!("Stopping: {reason}");
                self.state.stop_reason = Some(reason);
                Phase::Terminal
            }
            None => {
                self.state.stop_reason = None;
                if self.corpus.is_empty() {
                    Phase::SeedScan
                } else {
                    Phase::Train
                }
            }
        }
    }
}
