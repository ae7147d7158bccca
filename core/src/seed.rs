//! Seed hitlist loading.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};
use v6seek_common::network::Address;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read seed hitlist '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reads a hitlist file: one address per line, `#` starts a comment.
///
/// Unparseable lines are skipped with a warning and repeats are dropped, so
/// the result keeps first-seen order without duplicates.
pub fn load_hitlist(path: &Path) -> Result<Vec<Address>, SeedError> {
    let text = fs::read_to_string(path).map_err(|source| SeedError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let seeds = parse_hitlist(&text);
    info!("Loaded {} seed addresses from {}", seeds.len(), path.display());
    Ok(seeds)
}

pub fn parse_hitlist(text: &str) -> Vec<Address> {
    let mut seen = HashSet::new();
    let mut seeds = Vec::new();
    let mut skipped = 0usize;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<Address>() {
            Ok(addr) => {
                if seen.insert(addr) {
                    seeds.push(addr);
                }
            }
            Err(_) => {
                skipped += 1;
                warn!("Skipping invalid seed on line {}: '{line}'", idx + 1);
            }
        }
    }

    if skipped > 0 {
        warn!("{skipped} seed lines could not be parsed");
    }
    seeds
}
