//! The boundary to the external scanning executable.
//!
//! [`Prober`] is the capability the pipeline depends on; [`zmap`] is the
//! concrete subprocess-backed implementation. [`ProbeRunner`] wraps any prober
//! with the parts of the contract that must hold regardless of backend:
//! blacklist preflight, bounded retries with exponential backoff, and
//! filtering responses down to what was actually asked for.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use v6seek_common::config::ProberConfig;
use v6seek_common::network::Address;

use crate::blacklist::BlacklistRegistry;

pub mod zmap;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient probe failure: {0}")]
    Transient(String),
    #[error("probe failed: {0}")]
    Fatal(String),
}

impl ProbeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::Transient(_))
    }
}

/// Raised when a scan gives up. Scoped to the current phase only.
#[derive(Debug, Error)]
#[error("scan aborted after {attempts} attempt(s): {last}")]
pub struct ScanAborted {
    pub attempts: u32,
    #[source]
    pub last: ProbeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    /// Packets per second. 0 leaves pacing to the backend.
    pub rate: u64,
    pub timeout: Duration,
}

impl From<&ProberConfig> for ScanParams {
    fn from(cfg: &ProberConfig) -> Self {
        Self {
            rate: cfg.rate,
            timeout: cfg.timeout(),
        }
    }
}

/// Synchronous capability interface to a network prober.
pub trait Prober: Send + Sync {
    /// Whether the backend can run at all. Checked once at startup.
    fn check_available(&self) -> Result<bool, ProbeError>;

    /// Probes `batch` and returns the addresses that answered.
    fn scan(&self, batch: &[Address], params: &ScanParams) -> Result<Vec<Address>, ProbeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&ProberConfig> for RetryPolicy {
    fn from(cfg: &ProberConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: cfg.backoff_base(),
            max_delay: cfg.backoff_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub live: Vec<Address>,
    /// Addresses handed to the backend after preflight filtering.
    pub submitted: usize,
    pub attempts: u32,
}

pub struct ProbeRunner {
    prober: Box<dyn Prober>,
    blacklist: Arc<BlacklistRegistry>,
    retry: RetryPolicy,
    params: ScanParams,
}

impl ProbeRunner {
    pub fn new(
        prober: Box<dyn Prober>,
        blacklist: Arc<BlacklistRegistry>,
        retry: RetryPolicy,
        params: ScanParams,
    ) -> Self {
        Self {
            prober,
            blacklist,
            retry,
            params,
        }
    }

    pub fn check_available(&self) -> Result<bool, ProbeError> {
        self.prober.check_available()
    }

    /// Runs one scan with preflight filtering and retries.
    ///
    /// Transient failures are retried up to `max_retries` times; a fatal
    /// failure or an exhausted budget returns [`ScanAborted`].
    pub fn probe(&self, batch: &[Address]) -> Result<ProbeOutcome, ScanAborted> {
        let mut targets = batch.to_vec();
        let dropped = self.blacklist.retain_allowed(&mut targets);
        if dropped > 0 {
            debug!("Preflight removed {dropped} blacklisted targets");
        }
        if targets.is_empty() {
            return Ok(ProbeOutcome {
                live: Vec::new(),
                submitted: 0,
                attempts: 0,
            });
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.prober.scan(&targets, &self.params) {
                Ok(responses) => {
                    let live = self.accept(&targets, responses);
                    return Ok(ProbeOutcome {
                        live,
                        submitted: targets.len(),
                        attempts,
                    });
                }
                Err(err) if err.is_transient() && attempts <= self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempts);
                    warn!(
                        "Scan attempt {attempts} failed ({err}); retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    std::thread::sleep(delay);
                }
                Err(last) => return Err(ScanAborted { attempts, last }),
            }
        }
    }

    /// Keeps responses that were probed, are not blacklisted and are not repeated.
    fn accept(&self, targets: &[Address], responses: Vec<Address>) -> Vec<Address> {
        let asked: HashSet<&Address> = targets.iter().collect();
        let mut seen = HashSet::with_capacity(responses.len());
        let total = responses.len();
        let live: Vec<Address> = responses
            .into_iter()
            .filter(|addr| asked.contains(addr) && !self.blacklist.contains(addr))
            .filter(|addr| seen.insert(*addr))
            .collect();
        if live.len() < total {
            debug!("Discarded {} unsolicited or repeated responses", total - live.len());
        }
        live
    }
}
