use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    SeedScan,
    Train,
    Generate,
    Scan,
    Merge,
    Checkpoint,
    Terminal,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::SeedScan => "SEED_SCAN",
            Phase::Train => "TRAIN",
            Phase::Generate => "GENERATE",
            Phase::Scan => "SCAN",
            Phase::Merge => "MERGE",
            Phase::Checkpoint => "CHECKPOINT",
            Phase::Terminal => "TERMINAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationCap,
    Converged,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::IterationCap => "iteration cap reached",
            StopReason::Converged => "model converged",
            StopReason::Cancelled => "shutdown requested",
        };
        f.write_str(reason)
    }
}

/// The single durable record of pipeline progress.
///
/// `phase` is the phase a resumed run should enter next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub phase: Phase,
    /// Completed generate/scan/merge loops.
    pub iteration: u64,
    pub model_version: u64,
    /// Corpus records covered by the last checkpoint.
    pub corpus_len: u64,
    /// Consecutive generations that fell short of the requested batch size.
    pub stalled_generations: u32,
    /// Base seed for candidate generation.
    pub seed: u64,
    pub total_candidates: u64,
    /// Hits from generated batches whose scan was committed. Seed hits and
    /// records recovered after a crash grow the corpus but are not counted.
    pub total_hits: u64,
    pub stop_reason: Option<StopReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    pub fn fresh(seed: u64) -> Self {
        let now = Utc::now();
        Self {
            phase: Phase::Init,
            iteration: 0,
            model_version: 0,
            corpus_len: 0,
            stalled_generations: 0,
            seed,
            total_candidates: 0,
            total_hits: 0,
            stop_reason: None,
            created_at: now,
            updated_at: now,
            last_checkpoint_at: None,
        }
    }
}
