//! Fixed-record binary log of corpus addresses.
//!
//! One 16-byte big-endian record per address, in insertion order. New
//! addresses are appended and fsynced; only an explicit rebuild rewrites the
//! file, and that goes through an atomic rename.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use v6seek_common::network::Address;
use v6seek_common::network::address::ADDRESS_BYTES;

use super::{PersistenceError, io_error, write_atomic};

pub const RECORD_LEN: usize = ADDRESS_BYTES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContents {
    pub records: Vec<Address>,
    /// Bytes after the last whole record, left behind by an interrupted append.
    pub trailing_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct CorpusLog {
    path: PathBuf,
}

impl CorpusLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every whole record. A missing file is an empty log.
    pub fn read_all(&self) -> Result<LogContents, PersistenceError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_error(&self.path, e)),
        };

        let chunks = bytes.chunks_exact(RECORD_LEN);
        let trailing_bytes = chunks.remainder().len();
        let records = chunks
            .map(|chunk| {
                let mut octets = [0u8; RECORD_LEN];
                octets.copy_from_slice(chunk);
                Address::from_octets(octets)
            })
            .collect();

        Ok(LogContents {
            records,
            trailing_bytes,
        })
    }

    pub fn append(&self, addrs: &[Address]) -> Result<(), PersistenceError> {
        if addrs.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(addrs.len() * RECORD_LEN);
        for addr in addrs {
            buf.extend_from_slice(addr.as_bytes());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_error(&self.path, e))?;
        file.write_all(&buf).map_err(|e| io_error(&self.path, e))?;
        file.sync_data().map_err(|e| io_error(&self.path, e))
    }

    /// Cuts the log back to `records` whole records.
    pub fn truncate_to(&self, records: usize) -> Result<(), PersistenceError> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| io_error(&self.path, e))?;
        file.set_len((records * RECORD_LEN) as u64)
            .map_err(|e| io_error(&self.path, e))?;
        file.sync_all().map_err(|e| io_error(&self.path, e))
    }

    /// Replaces the whole log atomically.
    pub fn rewrite(&self, addrs: &[Address]) -> Result<(), PersistenceError> {
        let mut buf = Vec::with_capacity(addrs.len() * RECORD_LEN);
        for addr in addrs {
            buf.extend_from_slice(addr.as_bytes());
        }
        write_atomic(&self.path, &buf).map_err(|e| io_error(&self.path, e))
    }
}
