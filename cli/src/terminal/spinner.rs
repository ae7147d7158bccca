use std::sync::OnceLock;
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use v6seek_core::pipeline::{Phase, PhaseReport};

use crate::terminal::colors;

pub(crate) static SPINNER: OnceLock<ProgressBar> = OnceLock::new();

pub fn get_spinner() -> &'static ProgressBar {
    SPINNER.get_or_init(init_spinner)
}

fn init_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.blue} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&[
            "▁▁▁▁▁",
            "▁▂▂▂▁",
            "▁▄▂▄▁",
            "▂▄▆▄▂",
            "▄▆█▆▄",
            "▂▄▆▄▂",
            "▁▄▂▄▁",
            "▁▂▂▂▁",
        ]);

    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn describe(phase: Phase) -> &'static str {
    match phase {
        Phase::Init => "Restoring state",
        Phase::SeedScan => "Probing seed hitlist",
        Phase::Train => "Training model",
        Phase::Generate => "Generating candidates",
        Phase::Scan => "Scanning candidates",
        Phase::Merge => "Merging responses",
        Phase::Checkpoint => "Writing checkpoint",
        Phase::Terminal => "Stopping",
    }
}

/// Shows the phase about to run along with loop counters.
pub fn report_phase(report: &PhaseReport) {
    let mut msg = format!(
        "{} {} iteration {}, {} addresses known",
        describe(report.next).color(colors::TEXT_DEFAULT),
        "|".color(colors::SEPARATOR),
        report.iteration.to_string().color(colors::ACCENT),
        report.corpus_len.to_string().green().bold(),
    );
    if report.next == Phase::Scan {
        msg.push_str(&format!(", {} in flight", report.pending));
    }
    get_spinner().set_message(msg);
}

pub fn finish() {
    if let Some(pb) = SPINNER.get() {
        pb.finish_and_clear();
    }
}

/// Routes log lines above the spinner so they do not tear it.
pub struct SpinnerWriter;

impl std::io::Write for SpinnerWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf);
        let msg = msg.trim_end();
        match SPINNER.get() {
            Some(pb) if !pb.is_finished() => pb.println(msg),
            _ => eprintln!("{msg}"),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
