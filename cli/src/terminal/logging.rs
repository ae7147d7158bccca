use std::sync::Mutex;

use anyhow::Context;
use colored::*;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::format::{self, Writer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};
use v6seek_common::config::LogConfig;

use super::print::{self, PRINT_TARGET};
use super::rotate::{RotatingFile, RotationPolicy};
use super::spinner::SpinnerWriter;

/// Console format: one coloured status symbol per level, then the message.
/// Terminal output from [`super::print`] is passed through untouched.
pub struct SeekFormatter;

impl<S, N> FormatEvent<S, N> for SeekFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> format::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();

        if meta.target() != PRINT_TARGET {
            let (symbol, color_func): (&str, fn(ColoredString) -> ColoredString) =
                match *meta.level() {
                    Level::TRACE => ("[ ]", |s| s.dimmed()),
                    Level::DEBUG => ("[?]", |s| s.blue()),
                    Level::INFO => ("[+]", |s| s.green().bold()),
                    Level::WARN => ("[*]", |s| s.yellow().bold()),
                    Level::ERROR => ("[-]", |s| s.red().bold()),
                };
            write!(writer, "{} ", color_func(symbol.into()))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Terminal output stays visible whatever the configured level.
fn filter_directives(level: &str) -> String {
    format!("{level},{PRINT_TARGET}=info")
}

/// Installs the global subscriber: a plain rotating file log, plus the
/// coloured console when enabled.
pub fn init(cfg: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(filter_directives(&cfg.level))
        .with_context(|| format!("Invalid log level '{}'", cfg.level))?;
    print::set_direct(!cfg.console);

    let file = RotatingFile::open(&cfg.file, RotationPolicy::from(cfg))
        .with_context(|| format!("Failed to open log file {}", cfg.file.display()))?;
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .with_filter(filter_fn(|meta| meta.target() != PRINT_TARGET));

    let console_layer = cfg.console.then(|| {
        fmt::layer()
            .event_format(SeekFormatter)
            .with_writer(|| SpinnerWriter)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install the log subscriber")
}
