//! Range exclusion over the IPv6 space.
//!
//! Ranges are normalised into a sorted list of disjoint, non-adjacent blocks so
//! membership is a single binary search over range starts. The registry is
//! loaded once and shared read-only by the generator, the prober and the merge
//! step.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use v6seek_common::network::{Address, AddressRange};

#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error("failed to read blacklist '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("blacklist line {line}: '{value}': {reason}")]
    Parse {
        line: usize,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BlacklistRegistry {
    ranges: Vec<AddressRange>,
    fingerprint: String,
}

impl Default for BlacklistRegistry {
    fn default() -> Self {
        Self::from_ranges(Vec::new())
    }
}

impl BlacklistRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = AddressRange>) -> Self {
        let ranges = normalize(ranges.into_iter().filter(|r| !r.is_empty()).collect());
        let fingerprint = fingerprint(&ranges);
        Self { ranges, fingerprint }
    }

    pub fn load(path: &Path) -> Result<Self, BlacklistError> {
        let text = fs::read_to_string(path).map_err(|source| BlacklistError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::parse(&text)?;
        info!(
            "Loaded blacklist from '{}' ({} excluded ranges)",
            path.display(),
            registry.len()
        );
        Ok(registry)
    }

    /// Parses one range per line. Blank lines and `#` comments are ignored.
    pub fn parse(text: &str) -> Result<Self, BlacklistError> {
        let mut ranges = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let value = raw.split('#').next().unwrap_or_default().trim();
            if value.is_empty() {
                continue;
            }
            let range = value
                .parse::<AddressRange>()
                .map_err(|e| BlacklistError::Parse {
                    line: idx + 1,
                    value: value.to_string(),
                    reason: e.to_string(),
                })?;
            ranges.push(range);
        }
        Ok(Self::from_ranges(ranges))
    }

    /// O(log n) membership test.
    pub fn contains(&self, addr: &Address) -> bool {
        let idx = self.ranges.partition_point(|range| range.start <= *addr);
        idx > 0 && self.ranges[idx - 1].end >= *addr
    }

    /// Drops blacklisted addresses in place and returns how many were removed.
    pub fn retain_allowed(&self, addrs: &mut Vec<Address>) -> usize {
        let before = addrs.len();
        if !self.ranges.is_empty() {
            addrs.retain(|addr| !self.contains(addr));
        }
        before - addrs.len()
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// SHA-256 over the normalised ranges. Equal registries have equal fingerprints.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn normalize(mut ranges: Vec<AddressRange>) -> Vec<AddressRange> {
    ranges.sort_by_key(|r| (r.start, r.end));
    let mut merged: Vec<AddressRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.touches(&range) => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

fn fingerprint(ranges: &[AddressRange]) -> String {
    let mut hasher = Sha256::new();
    for range in ranges {
        hasher.update(range.start.as_bytes());
        hasher.update(range.end.as_bytes());
    }
    hex::encode(hasher.finalize())
}
