use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::terminal::colors;
use colored::*;
use tracing::info;
use unicode_width::UnicodeWidthStr;
use v6seek_common::config::Config;
use v6seek_core::pipeline::RunSummary;

pub const TOTAL_WIDTH: usize = 64;
pub const PRINT_TARGET: &str = "v6seek::print";
const KEY_WIDTH: usize = 18;

const BANNER: &str = r#"
             __
      _   __/ /_  ________  ___  / /__
     | | / / __ \/ ___/ _ \/ _ \/ //_/
     | |/ / /_/ (__  )  __/  __/ ,<
     |___/\____/____/\___/\___/_/|_|
"#;

pub trait WithDefaultColor {
    fn with_default(self, default_color: Color) -> ColoredString;
}

impl WithDefaultColor for &str {
    fn with_default(self, default_color: Color) -> ColoredString {
        self.color(default_color)
    }
}

impl WithDefaultColor for String {
    fn with_default(self, default_color: Color) -> ColoredString {
        self.color(default_color)
    }
}

impl WithDefaultColor for ColoredString {
    fn with_default(self, _default_color: Color) -> ColoredString {
        self
    }
}

static DIRECT: AtomicBool = AtomicBool::new(false);

/// Sends terminal output straight to stdout, for runs without a console log
/// layer.
pub fn set_direct(direct: bool) {
    DIRECT.store(direct, Ordering::Relaxed);
}

pub fn print(msg: &str) {
    if DIRECT.load(Ordering::Relaxed) {
        println!("{msg}");
    } else {
        info!(target: PRINT_TARGET, "{msg}");
    }
}

pub fn banner() {
    let text_content: String = format!("⟦ V6SEEK v{} ⟧ ", env!("CARGO_PKG_VERSION"));
    let text_width: usize = UnicodeWidthStr::width(text_content.as_str());
    let text: ColoredString = text_content.bright_green().bold();
    let sep: ColoredString = "═"
        .repeat(TOTAL_WIDTH.saturating_sub(text_width) / 2)
        .bright_black();

    print(&format!("{}", BANNER.trim_end_matches('\n').color(colors::PRIMARY)));
    print(&format!("{sep}{text}{sep}"));
    centerln(&format!("{}", "model-guided IPv6 address discovery".dimmed()));
}

pub fn header(msg: &str) {
    let formatted: String = format!("⟦ {} ⟧", msg);
    let msg_len: usize = UnicodeWidthStr::width(formatted.as_str());

    let dash_count: usize = TOTAL_WIDTH.saturating_sub(msg_len);
    let left: usize = dash_count / 2;
    let right: usize = dash_count - left;

    let line: ColoredString = format!(
        "{}{}{}",
        "─".repeat(left),
        formatted.to_uppercase().bright_green(),
        "─".repeat(right)
    )
    .bright_black();

    print(&format!("{}", line));
}

pub fn aligned_line<V>(key: &str, value: V)
where
    V: Display + WithDefaultColor,
{
    let dots: String = ".".repeat((KEY_WIDTH + 1).saturating_sub(key.len()));
    let colon: String = format!(
        "{}{}",
        dots.color(colors::SEPARATOR),
        ":".color(colors::SEPARATOR)
    );
    let value: ColoredString = value.with_default(colors::TEXT_DEFAULT);
    print_status(format!("{}{} {}", key.color(colors::PRIMARY), colon, value));
}

pub fn print_status<T: AsRef<str>>(msg: T) {
    let prefix: ColoredString = ">".color(colors::SEPARATOR);
    let message: String = format!("{} {}", prefix, msg.as_ref().color(colors::TEXT_DEFAULT));
    print(&message);
}

pub fn centerln(msg: &str) {
    let space = " ".repeat(TOTAL_WIDTH.saturating_sub(console::measure_text_width(msg)) / 2);
    print(&format!("{}{}{}", space, msg, space));
}

pub fn configuration(cfg: &Config) {
    header("configuration");
    aligned_line("State file", cfg.state.state_file.display().to_string());
    aligned_line("Corpus log", cfg.state.corpus_file.display().to_string());
    aligned_line("Seed hitlist", cfg.inputs.seed_file.display().to_string());
    let blacklist = match &cfg.inputs.blacklist_file {
        Some(path) => path.display().to_string().normal(),
        None => "none".color(colors::WARNING),
    };
    aligned_line("Blacklist", blacklist);
    aligned_line("Scanner", cfg.prober.exec_path.display().to_string());
    aligned_line("Cluster prefix", format!("/{}", cfg.model.prefix_len));
    aligned_line("Batch size", cfg.pipeline.batch_size.to_string());
    let cap = match cfg.pipeline.max_iterations {
        0 => "unlimited".to_string(),
        n => n.to_string(),
    };
    aligned_line("Iteration cap", cap);
}

pub fn summary(summary: &RunSummary) {
    header("run summary");
    aligned_line("Iterations", summary.iterations.to_string().color(colors::ACCENT));
    aligned_line("Corpus size", summary.corpus_len.to_string().green().bold());
    aligned_line("Model version", summary.model_version.to_string());
    aligned_line("Candidates", summary.total_candidates.to_string());
    aligned_line("Hits", summary.total_hits.to_string().green());
    let rate = if summary.total_candidates > 0 {
        summary.total_hits as f64 / summary.total_candidates as f64 * 100.0
    } else {
        0.0
    };
    aligned_line("Hit rate", format!("{rate:.3}%"));
    let reason = match summary.stop_reason {
        Some(reason) => reason.to_string().normal(),
        None => "interrupted".color(colors::WARNING),
    };
    aligned_line("Stopped", reason);
}

pub fn end_of_program() {
    print(&format!(
        "{}",
        "═".repeat(TOTAL_WIDTH).color(colors::SEPARATOR)
    ));
}
