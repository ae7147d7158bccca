//! Size-bounded log file writer.
//!
//! When a write would push the active file past its size limit, the file is
//! renamed to `<name>.<unix-ts>` (with a `-N` suffix if that name is taken)
//! and a fresh file is opened. Old backups are pruned by count and by age.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use v6seek_common::config::LogConfig;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// 0 disables rotation.
    pub max_bytes: u64,
    /// 0 keeps every backup.
    pub max_backups: usize,
    pub max_age: Option<Duration>,
}

impl From<&LogConfig> for RotationPolicy {
    fn from(cfg: &LogConfig) -> Self {
        Self {
            max_bytes: cfg.max_size_mb.saturating_mul(1024 * 1024),
            max_backups: cfg.max_backups,
            max_age: (cfg.max_age_days > 0)
                .then(|| Duration::from_secs(cfg.max_age_days.saturating_mul(SECS_PER_DAY))),
        }
    }
}

pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    policy: RotationPolicy,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Backup {
    stamp: u64,
    seq: u32,
    path: PathBuf,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl RotatingFile {
    pub fn open(path: &Path, policy: RotationPolicy) -> io::Result<Self> {
        let file = open_append(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            policy,
        })
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let stamp = unix_now();
        let base = format!("{}.{stamp}", self.file_name());
        let mut target = self.path.with_file_name(&base);
        let mut seq = 0;
        while target.exists() {
            seq += 1;
            target = self.path.with_file_name(format!("{base}-{seq}"));
        }

        fs::rename(&self.path, &target)?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        self.prune(stamp)
    }

    fn backups(&self) -> io::Result<Vec<Backup>> {
        let prefix = format!("{}.", self.file_name());
        let mut found = Vec::new();
        for entry in fs::read_dir(self.dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let (stamp, seq) = match suffix.split_once('-') {
                Some((stamp, seq)) => (stamp.parse().ok(), seq.parse().ok()),
                None => (suffix.parse().ok(), Some(0)),
            };
            if let (Some(stamp), Some(seq)) = (stamp, seq) {
                found.push(Backup {
                    stamp,
                    seq,
                    path: entry.path(),
                });
            }
        }
        found.sort();
        Ok(found)
    }

    fn prune(&self, now: u64) -> io::Result<()> {
        let mut backups = self.backups()?;

        if let Some(max_age) = self.policy.max_age {
            let cutoff = now.saturating_sub(max_age.as_secs());
            let (expired, kept): (Vec<Backup>, Vec<Backup>) =
                backups.into_iter().partition(|b| b.stamp < cutoff);
            for backup in expired {
                fs::remove_file(&backup.path)?;
            }
            backups = kept;
        }

        if self.policy.max_backups > 0 && backups.len() > self.policy.max_backups {
            let excess = backups.len() - self.policy.max_backups;
            for backup in backups.drain(..excess) {
                fs::remove_file(&backup.path)?;
            }
        }
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let limit = self.policy.max_bytes;
        if limit > 0 && self.written > 0 && self.written + buf.len() as u64 > limit {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
