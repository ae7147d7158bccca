//! Durable storage for pipeline progress.
//!
//! Three files make up a checkpoint:
//!
//! * the **corpus log**, an append-only sequence of fixed-size records;
//! * the **model snapshot**, a bincode envelope written atomically;
//! * the **state file**, JSON, written atomically last. It references the other
//!   two by path and checksum, so replacing it is the commit point.
//!
//! Anything on disk that the state file does not reference is not yet durable.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use v6seek_common::config::StateConfig;

use crate::corpus::AddressCorpus;
use crate::model::AddressModel;
use crate::pipeline::state::PipelineState;

mod corpus_log;

pub use corpus_log::{CorpusLog, LogContents, RECORD_LEN};

pub const SCHEMA_VERSION: u32 = 1;

const MODEL_MAGIC: [u8; 4] = *b"V6SM";
const MODEL_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot decode '{path}': {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("state file schema {found} is newer than supported schema {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
    #[error("corpus log is inconsistent with the checkpoint: {0}")]
    Corrupt(String),
}

pub(crate) fn io_error(path: &Path, source: io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusRef {
    pub path: PathBuf,
    pub checksum: String,
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub path: PathBuf,
    pub checksum: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub schema_version: u32,
    pub state: PipelineState,
    pub corpus: CorpusRef,
    pub model: Option<ModelRef>,
    pub blacklist_fingerprint: String,
}

#[derive(Serialize)]
struct ModelEnvelopeRef<'a> {
    magic: [u8; 4],
    format: u32,
    model: &'a AddressModel,
}

#[derive(Deserialize)]
struct ModelEnvelope {
    magic: [u8; 4],
    format: u32,
    model: AddressModel,
}

/// Writes `bytes` to a sibling temp file, fsyncs it and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        // Directory fsync is not supported everywhere.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct Store {
    state_path: PathBuf,
    model_path: PathBuf,
    corpus_log: CorpusLog,
}

impl Store {
    pub fn new(cfg: &StateConfig) -> Self {
        Self::from_paths(&cfg.state_file, &cfg.corpus_file, &cfg.model_file)
    }

    pub fn from_paths(state: &Path, corpus: &Path, model: &Path) -> Self {
        Self {
            state_path: state.to_path_buf(),
            model_path: model.to_path_buf(),
            corpus_log: CorpusLog::new(corpus),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn corpus_log(&self) -> &CorpusLog {
        &self.corpus_log
    }

    /// Reads the last committed checkpoint. `None` means a fresh start.
    pub fn load(&self) -> Result<Option<StateFile>, PersistenceError> {
        let content = match fs::read_to_string(&self.state_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&self.state_path, e)),
        };

        let decode = |reason: String| PersistenceError::Decode {
            path: self.state_path.clone(),
            reason,
        };
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| decode(e.to_string()))?;
        let found = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| decode("missing schema_version".to_string()))?;
        if found > SCHEMA_VERSION as u64 {
            return Err(PersistenceError::UnsupportedSchema {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                supported: SCHEMA_VERSION,
            });
        }

        let file: StateFile = serde_json::from_value(value).map_err(|e| decode(e.to_string()))?;
        debug!(
            "Loaded checkpoint: phase {}, iteration {}, {} corpus records",
            file.state.phase, file.state.iteration, file.corpus.records
        );
        Ok(Some(file))
    }

    /// Commits a checkpoint by atomically replacing the state file.
    pub fn save(
        &self,
        state: &PipelineState,
        corpus: &CorpusRef,
        model: Option<&ModelRef>,
        blacklist_fingerprint: &str,
    ) -> Result<(), PersistenceError> {
        let file = StateFile {
            schema_version: SCHEMA_VERSION,
            state: state.clone(),
            corpus: corpus.clone(),
            model: model.cloned(),
            blacklist_fingerprint: blacklist_fingerprint.to_string(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| PersistenceError::Decode {
            path: self.state_path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.state_path, &json).map_err(|e| io_error(&self.state_path, e))
    }

    pub fn corpus_ref(&self, corpus: &AddressCorpus) -> CorpusRef {
        CorpusRef {
            path: self.corpus_log.path().to_path_buf(),
            checksum: corpus.checksum(),
            records: corpus.len() as u64,
        }
    }

    pub fn save_model(&self, model: &AddressModel) -> Result<ModelRef, PersistenceError> {
        let envelope = ModelEnvelopeRef {
            magic: MODEL_MAGIC,
            format: MODEL_FORMAT,
            model,
        };
        let bytes = bincode::serialize(&envelope).map_err(|e| PersistenceError::Decode {
            path: self.model_path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.model_path, &bytes).map_err(|e| io_error(&self.model_path, e))?;

        Ok(ModelRef {
            path: self.model_path.clone(),
            checksum: digest(&bytes),
            version: model.version(),
        })
    }

    /// Loads the snapshot a checkpoint refers to.
    ///
    /// A missing, altered or undecodable snapshot yields `None`: the model is
    /// derived data and gets retrained.
    pub fn load_model(&self, expected: &ModelRef) -> Option<AddressModel> {
        let bytes = match fs::read(&expected.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Model snapshot '{}' unreadable: {e}", expected.path.display());
                return None;
            }
        };
        if digest(&bytes) != expected.checksum {
            warn!(
                "Model snapshot '{}' does not match its checkpoint",
                expected.path.display()
            );
            return None;
        }

        match bincode::deserialize::<ModelEnvelope>(&bytes) {
            Ok(env) if env.magic == MODEL_MAGIC && env.format == MODEL_FORMAT => {
                if env.model.version() != expected.version {
                    warn!(
                        "Model snapshot has version {}, checkpoint expects {}",
                        env.model.version(),
                        expected.version
                    );
                    return None;
                }
                Some(env.model)
            }
            Ok(_) => {
                warn!("Model snapshot '{}' has an unknown format", expected.path.display());
                None
            }
            Err(e) => {
                warn!("Model snapshot '{}' failed to decode: {e}", expected.path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterRegistry;
    use crate::model::ModelParams;
    use crate::pipeline::state::Phase;
    use v6seek_common::network::Address;

    fn store(dir: &Path) -> Store {
        Store::from_paths(
            &dir.join("state.json"),
            &dir.join("corpus.bin"),
            &dir.join("model.bin"),
        )
    }

    fn corpus() -> AddressCorpus {
        let addrs = (1..=10u128).map(|i| Address::from_u128((0x2001_0db8u128 << 96) | i));
        AddressCorpus::from_records(addrs).0
    }

    #[test]
    fn missing_state_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).load().unwrap().is_none());
    }

    #[test]
    fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let corpus = corpus();
        let mut state = PipelineState::fresh(42);
        state.phase = Phase::Train;
        state.corpus_len = corpus.len() as u64;

        let corpus_ref = store.corpus_ref(&corpus);
        store.save(&state, &corpus_ref, None, "abc").unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.corpus, corpus_ref);
        assert_eq!(loaded.blacklist_fingerprint, "abc");
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.state_path(), r#"{"schema_version": 99}"#).unwrap();
        assert!(matches!(
            store.load(),
            Err(PersistenceError::UnsupportedSchema { found: 99, .. })
        ));
    }

    #[test]
    fn garbage_state_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.state_path(), "not json").unwrap();
        assert!(matches!(store.load(), Err(PersistenceError::Decode { .. })));
    }

    #[test]
    fn model_round_trip_and_tamper_detection() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let corpus = corpus();
        let params = ModelParams::default();
        let clusters = ClusterRegistry::build(params.prefix_len, &corpus);
        let model = AddressModel::train(3, &corpus, &clusters, &params);

        let model_ref = store.save_model(&model).unwrap();
        assert_eq!(model_ref.version, 3);
        assert_eq!(store.load_model(&model_ref), Some(model));

        let mut bytes = fs::read(&model_ref.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&model_ref.path, bytes).unwrap();
        assert!(store.load_model(&model_ref).is_none());
    }

    #[test]
    fn missing_model_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let model_ref = ModelRef {
            path: dir.path().join("nope.bin"),
            checksum: String::new(),
            version: 1,
        };
        assert!(store.load_model(&model_ref).is_none());
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }
}
