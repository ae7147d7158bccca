//! # Runtime Configuration
//!
//! Loaded once from a JSON file at startup and treated as read-only afterwards.
//! Every section has defaults, so a config file only needs the keys it changes.

use std::fs;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub state: StateConfig,
    pub inputs: InputConfig,
    pub log: LogConfig,
    pub prober: ProberConfig,
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
}

/// Where durable pipeline data lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub state_file: PathBuf,
    pub corpus_file: PathBuf,
    pub model_file: PathBuf,
    /// Target and response files handed to the scanner.
    pub scratch_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("state/state.json"),
            corpus_file: PathBuf::from("state/corpus.bin"),
            model_file: PathBuf::from("state/model.bin"),
            scratch_dir: PathBuf::from("scratch"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    /// Known-live addresses probed when the corpus is empty.
    pub seed_file: PathBuf,
    pub blacklist_file: Option<PathBuf>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            seed_file: PathBuf::from("hitlist.txt"),
            blacklist_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub file: PathBuf,
    pub level: String,
    pub max_size_mb: u64,
    /// Rotated files to keep. 0 keeps all of them.
    pub max_backups: usize,
    /// Rotated files older than this are removed. 0 disables the check.
    pub max_age_days: u64,
    /// Mirror log lines to the terminal.
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("logs/v6seek.log"),
            level: "info".to_string(),
            max_size_mb: 100,
            max_backups: 5,
            max_age_days: 30,
            console: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProberConfig {
    pub exec_path: PathBuf,
    pub probe_module: String,
    /// Packets per second. 0 defers to `bandwidth`.
    pub rate: u64,
    pub bandwidth: Option<String>,
    pub interface: Option<String>,
    pub source_address: Option<Ipv6Addr>,
    pub gateway_mac: Option<String>,
    pub cooldown_secs: u64,
    /// Hard limit for a single scanner invocation.
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub extra_args: Vec<String>,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            exec_path: PathBuf::from("zmap"),
            probe_module: "icmp6_echoscan".to_string(),
            rate: 10_000,
            bandwidth: None,
            interface: None,
            source_address: None,
            gateway_mac: None,
            cooldown_secs: 8,
            timeout_secs: 3_600,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            extra_args: Vec::new(),
        }
    }
}

impl ProberConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Tuning surface of the address model.
///
/// The defaults are a starting point rather than a derived optimum:
/// * clusters are /64 networks,
/// * a cluster needs 4 hosts before its own statistics are trusted,
/// * every unseen nibble value keeps a 0.05 pseudo-count,
/// * cluster weight grows linearly with host count.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub prefix_len: u8,
    pub min_cluster_size: u32,
    pub smoothing: f64,
    pub density_exponent: f64,
    /// Base seed for candidate generation. Random on first run when unset.
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            prefix_len: 64,
            min_cluster_size: 4,
            smoothing: 0.05,
            density_exponent: 1.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub attempts_per_candidate: usize,
    /// 0 runs until convergence or shutdown.
    pub max_iterations: u64,
    pub convergence_window: u32,
    pub max_scan_aborts: u32,
    /// Threads used for candidate generation. 0 uses the rayon default.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100_000,
            attempts_per_candidate: 16,
            max_iterations: 0,
            convergence_window: 3,
            max_scan_aborts: 3,
            workers: 0,
        }
    }
}

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;
        if model.prefix_len == 0 || model.prefix_len > 124 || model.prefix_len % 4 != 0 {
            return invalid(format!(
                "model.prefix_len must be a multiple of 4 between 4 and 124, got {}",
                model.prefix_len
            ));
        }
        if !model.smoothing.is_finite() || model.smoothing < 0.0 {
            return invalid(format!("model.smoothing must be >= 0, got {}", model.smoothing));
        }
        if !model.density_exponent.is_finite() || model.density_exponent < 0.0 {
            return invalid(format!(
                "model.density_exponent must be >= 0, got {}",
                model.density_exponent
            ));
        }

        let pipeline = &self.pipeline;
        if pipeline.batch_size == 0 {
            return invalid("pipeline.batch_size must be greater than 0");
        }
        if pipeline.attempts_per_candidate == 0 {
            return invalid("pipeline.attempts_per_candidate must be greater than 0");
        }
        if pipeline.convergence_window == 0 {
            return invalid("pipeline.convergence_window must be greater than 0");
        }
        if pipeline.max_scan_aborts == 0 {
            return invalid("pipeline.max_scan_aborts must be greater than 0");
        }

        if self.prober.exec_path.as_os_str().is_empty() {
            return invalid("prober.exec_path must not be empty");
        }
        if self.prober.probe_module.trim().is_empty() {
            return invalid("prober.probe_module must not be empty");
        }
        if self.prober.timeout_secs == 0 {
            return invalid("prober.timeout_secs must be greater than 0");
        }
        if self.prober.rate == 0 && self.prober.bandwidth.is_none() {
            return invalid("one of prober.rate or prober.bandwidth must be set");
        }

        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return invalid(format!("log.level '{}' is not one of {LOG_LEVELS:?}", self.log.level));
        }
        if self.log.max_size_mb == 0 {
            return invalid("log.max_size_mb must be greater than 0");
        }

        let state = &self.state;
        let files = [&state.state_file, &state.corpus_file, &state.model_file];
        for (i, a) in files.iter().enumerate() {
            if a.as_os_str().is_empty() {
                return invalid("state file paths must not be empty");
            }
            if files[i + 1..].contains(a) {
                return invalid(format!("'{}' is configured for more than one state file", a.display()));
            }
        }

        Ok(())
    }

    /// Every directory that must exist before the pipeline starts.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = [
            &self.state.state_file,
            &self.state.corpus_file,
            &self.state.model_file,
            &self.log.file,
        ]
        .iter()
        .filter_map(|file| file.parent())
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
        dirs.push(self.state.scratch_dir.clone());
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

fn invalid<T>(msg: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(msg.into()))
}
