//! zmap-backed [`Prober`].
//!
//! Each scan writes the targets to a scratch file, runs the executable with a
//! hard timeout and reads responsive source addresses back from its output
//! file. The subprocess is driven through tokio so a timed-out child is killed
//! when its future is dropped.
//!
//! `scan` blocks on the runtime handle it was given and must be called from a
//! blocking context (e.g. `spawn_blocking`), never from inside a task.

use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use v6seek_common::config::ProberConfig;
use v6seek_common::network::Address;

use super::{ProbeError, Prober, ScanParams};
use crate::blacklist::BlacklistRegistry;

const STDERR_TAIL: usize = 512;

pub struct ZmapProber {
    exec_path: PathBuf,
    probe_module: String,
    bandwidth: Option<String>,
    interface: Option<String>,
    source_address: Option<Ipv6Addr>,
    gateway_mac: Option<String>,
    cooldown_secs: u64,
    extra_args: Vec<String>,
    scratch_dir: PathBuf,
    blacklist: Arc<BlacklistRegistry>,
    runtime: Handle,
    runs: AtomicU64,
}

impl ZmapProber {
    pub fn new(
        cfg: &ProberConfig,
        scratch_dir: PathBuf,
        blacklist: Arc<BlacklistRegistry>,
        runtime: Handle,
    ) -> Self {
        Self {
            exec_path: cfg.exec_path.clone(),
            probe_module: cfg.probe_module.clone(),
            bandwidth: cfg.bandwidth.clone(),
            interface: cfg.interface.clone(),
            source_address: cfg.source_address,
            gateway_mac: cfg.gateway_mac.clone(),
            cooldown_secs: cfg.cooldown_secs,
            extra_args: cfg.extra_args.clone(),
            scratch_dir,
            blacklist,
            runtime,
            runs: AtomicU64::new(0),
        }
    }

    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    pub fn command_args(&self, targets: &Path, output: &Path, params: &ScanParams) -> Vec<String> {
        let mut args = vec![
            format!("--probe-module={}", self.probe_module),
            format!("--ipv6-target-file={}", targets.display()),
            format!("--output-file={}", output.display()),
            "--output-fields=saddr".to_string(),
        ];
        if params.rate > 0 {
            args.push(format!("--rate={}", params.rate));
        } else if let Some(bandwidth) = &self.bandwidth {
            args.push(format!("--bandwidth={bandwidth}"));
        }
        args.push(format!("--cooldown-time={}", self.cooldown_secs));
        if let Some(interface) = &self.interface {
            args.push(format!("--interface={interface}"));
        }
        if let Some(source) = &self.source_address {
            args.push(format!("--ipv6-source-ip={source}"));
        }
        if let Some(mac) = &self.gateway_mac {
            args.push(format!("--gateway-mac={mac}"));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn execute(&self, targets: &Path, output: &Path, params: &ScanParams) -> Result<(), ProbeError> {
        let args = self.command_args(targets, output, params);
        let exec = self.exec_path.clone();
        let timeout = params.timeout;
        debug!("Running {} {}", exec.display(), args.join(" "));

        self.runtime.block_on(async move {
            let child = Command::new(&exec)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                        ProbeError::Fatal(format!("cannot start '{}': {e}", exec.display()))
                    }
                    _ => ProbeError::Transient(format!("spawning '{}': {e}", exec.display())),
                })?;

            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Err(_) => Err(ProbeError::Timeout(timeout)),
                Ok(Err(e)) => Err(ProbeError::Transient(format!("waiting for scanner: {e}"))),
                Ok(Ok(out)) if out.status.success() => Ok(()),
                Ok(Ok(out)) => Err(ProbeError::Transient(format!(
                    "'{}' exited with {}: {}",
                    exec.display(),
                    out.status,
                    stderr_tail(&out.stderr)
                ))),
            }
        })
    }
}

impl Prober for ZmapProber {
    fn check_available(&self) -> Result<bool, ProbeError> {
        match std::process::Command::new(&self.exec_path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
        {
            Ok(out) => {
                let version = String::from_utf8_lossy(&out.stdout);
                if let Some(line) = version.lines().next() {
                    debug!("Scanner reports version: {line}");
                }
                Ok(out.status.success())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProbeError::Fatal(format!(
                "cannot run '{}': {e}",
                self.exec_path.display()
            ))),
        }
    }

    fn scan(&self, batch: &[Address], params: &ScanParams) -> Result<Vec<Address>, ProbeError> {
        let mut targets = batch.to_vec();
        self.blacklist.retain_allowed(&mut targets);
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let stamp = format!("{}-{run}", std::process::id());
        let target_file = self.scratch_dir.join(format!("targets-{stamp}.txt"));
        let output_file = self.scratch_dir.join(format!("responses-{stamp}.txt"));

        write_targets(&target_file, &targets)
            .map_err(|e| ProbeError::Transient(format!("writing target file: {e}")))?;

        info!("Probing {} targets", targets.len());
        let result = self
            .execute(&target_file, &output_file, params)
            .and_then(|()| {
                fs::read_to_string(&output_file)
                    .map(|text| parse_responses(&text))
                    .map_err(|e| ProbeError::Transient(format!("reading scanner output: {e}")))
            });

        for file in [&target_file, &output_file] {
            if let Err(e) = fs::remove_file(file) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Could not remove scratch file '{}': {e}", file.display());
                }
            }
        }
        result
    }
}

/// Writes one address per line.
pub fn write_targets(path: &Path, addrs: &[Address]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for addr in addrs {
        writeln!(out, "{addr}")?;
    }
    out.flush()
}

/// Lines that parse as IPv6 addresses are responses; headers and noise are skipped.
pub fn parse_responses(text: &str) -> Vec<Address> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split(',').next()?.parse::<Address>().ok())
        .collect()
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map_or(0, |(idx, _)| idx);
    trimmed[start..].to_string()
}
