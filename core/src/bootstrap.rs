use std::fs;

use anyhow::Context;
use tracing::{debug, info};
use v6seek_common::config::Config;

/// Creates every directory the configuration points into.
pub fn initialize_filesystem(config: &Config) -> anyhow::Result<()> {
    for dir in config.directories() {
        if dir.is_dir() {
            debug!("Directory {} already exists", dir.display());
            continue;
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        info!("Created directory {}", dir.display());
    }
    Ok(())
}
