use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use v6seek_common::network::{Address, NetworkPrefix};
use v6seek_core::blacklist::BlacklistRegistry;
use v6seek_core::model::ModelParams;
use v6seek_core::persistence::Store;
use v6seek_core::pipeline::{PipelineSettings, SeedSource, StateMachine};
use v6seek_core::prober::{ProbeError, ProbeRunner, Prober, RetryPolicy, ScanParams};

pub fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

pub fn prefix(s: &str, len: u8) -> NetworkPrefix {
    NetworkPrefix::new(addr(s), len)
}

/// Eight seeds in each of four /64 networks under 2001:db8::/48.
pub fn seeds() -> Vec<Address> {
    (1..=4u16)
        .flat_map(|net| (1..=8u16).map(move |host| addr(&format!("2001:db8:0:{net:x}::{host:x}"))))
        .collect()
}

struct Inner {
    live: Box<dyn Fn(&Address) -> bool + Send + Sync>,
    failures: Mutex<VecDeque<ProbeError>>,
    probed: Mutex<Vec<Address>>,
    scans: Mutex<usize>,
}

/// In-memory prober. Answers for every address accepted by `live`, after
/// replaying any queued failures.
#[derive(Clone)]
pub struct ScriptedProber {
    inner: Arc<Inner>,
}

impl ScriptedProber {
    pub fn new(live: impl Fn(&Address) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                live: Box::new(live),
                failures: Mutex::new(VecDeque::new()),
                probed: Mutex::new(Vec::new()),
                scans: Mutex::new(0),
            }),
        }
    }

    /// Everything under 2001:db8::/32 answers.
    pub fn documentation_net() -> Self {
        let net = prefix("2001:db8::", 32);
        Self::new(move |a| net.contains(a))
    }

    /// Only the given addresses answer.
    pub fn only(live: Vec<Address>) -> Self {
        Self::new(move |a| live.contains(a))
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = ProbeError>) {
        self.inner.failures.lock().unwrap().extend(errors);
    }

    /// Every address handed to a successful scan, in order.
    pub fn probed(&self) -> Vec<Address> {
        self.inner.probed.lock().unwrap().clone()
    }

    /// Backend invocations, failed ones included.
    pub fn scans(&self) -> usize {
        *self.inner.scans.lock().unwrap()
    }
}

impl Prober for ScriptedProber {
    fn check_available(&self) -> Result<bool, ProbeError> {
        Ok(true)
    }

    fn scan(&self, batch: &[Address], _: &ScanParams) -> Result<Vec<Address>, ProbeError> {
        *self.inner.scans.lock().unwrap() += 1;
        if let Some(err) = self.inner.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.inner.probed.lock().unwrap().extend_from_slice(batch);
        Ok(batch.iter().copied().filter(|a| (self.inner.live)(a)).collect())
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        batch_size: 50,
        attempts_per_candidate: 16,
        max_iterations: 0,
        convergence_window: 3,
        max_scan_aborts: 3,
        workers: 2,
        model: ModelParams {
            prefix_len: 64,
            min_cluster_size: 4,
            smoothing: 0.05,
            density_exponent: 1.0,
        },
        seed: Some(7),
    }
}

pub fn store(dir: &Path) -> Store {
    Store::from_paths(
        &dir.join("state.json"),
        &dir.join("corpus.bin"),
        &dir.join("model.bin"),
    )
}

/// One state directory shared by successive runs, as across process restarts.
pub struct Fixture {
    pub dir: TempDir,
    pub cancel: Arc<AtomicBool>,
    pub seeds: Vec<Address>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_seeds(seeds())
    }

    pub fn with_seeds(seeds: Vec<Address>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            cancel: Arc::new(AtomicBool::new(false)),
            seeds,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn machine(
        &self,
        prober: &ScriptedProber,
        blacklist: BlacklistRegistry,
        settings: PipelineSettings,
    ) -> StateMachine {
        let blacklist = Arc::new(blacklist);
        let runner = ProbeRunner::new(
            Box::new(prober.clone()),
            blacklist.clone(),
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            ScanParams {
                rate: 0,
                timeout: Duration::from_secs(5),
            },
        );
        StateMachine::new(
            settings,
            store(self.path()),
            runner,
            blacklist,
            SeedSource::List(self.seeds.clone()),
            self.cancel.clone(),
        )
        .unwrap()
    }
}
