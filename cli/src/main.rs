mod commands;
mod terminal;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use v6seek_common::config::Config;
use v6seek_core::blacklist::BlacklistRegistry;
use v6seek_core::bootstrap;
use v6seek_core::persistence::Store;
use v6seek_core::pipeline::{PipelineError, PipelineSettings, SeedSource, StateMachine};
use v6seek_core::prober::zmap::ZmapProber;
use v6seek_core::prober::{ProbeRunner, RetryPolicy, ScanParams};

use commands::CommandLine;
use terminal::{logging, print, spinner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CommandLine::parse_args();

    let mut config = match Config::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };
    if let Some(cap) = args.max_iterations {
        config.pipeline.max_iterations = cap;
    }

    if let Err(e) = bootstrap::initialize_filesystem(&config) {
        eprintln!("{e:#}");
        return Err(e);
    }
    logging::init(&config.log)?;

    if !args.no_banner {
        print::banner();
    }
    print::configuration(&config);

    let blacklist = match load_blacklist(&config) {
        Ok(blacklist) => Arc::new(blacklist),
        Err(e) => return Err(fatal(e)),
    };

    let prober = ZmapProber::new(
        &config.prober,
        config.state.scratch_dir.clone(),
        blacklist.clone(),
        Handle::current(),
    );
    let exec_path = prober.exec_path().to_path_buf();
    let runner = ProbeRunner::new(
        Box::new(prober),
        blacklist.clone(),
        RetryPolicy::from(&config.prober),
        ScanParams::from(&config.prober),
    );

    let cancel = Arc::new(AtomicBool::new(false));
    tokio::spawn(shutdown_handler(cancel.clone()));

    let mut machine = match StateMachine::new(
        PipelineSettings::from(&config),
        Store::new(&config.state),
        runner,
        blacklist,
        SeedSource::File(config.inputs.seed_file.clone()),
        cancel,
    ) {
        Ok(machine) => machine,
        Err(e) => return Err(fatal(e)),
    };
    if config.log.console {
        machine = machine.with_hook(Box::new(spinner::report_phase));
    }

    print::header("discovery");
    let (outcome, summary) = tokio::task::spawn_blocking(move || {
        let outcome = machine.preflight().and_then(|()| {
            info!("Using scanner at {}", exec_path.display());
            machine.run()
        });
        (outcome, machine.summary())
    })
    .await
    .context("Discovery worker panicked")?;

    spinner::finish();
    print::summary(&summary);
    print::end_of_program();

    match outcome {
        Ok(_) => Ok(()),
        Err(e) if e.is_fatal() => Err(fatal(e)),
        Err(e) => {
            warn!("{e}. The next run resumes from the last checkpoint");
            Err(e.into())
        }
    }
}

fn load_blacklist(config: &Config) -> Result<BlacklistRegistry, PipelineError> {
    match &config.inputs.blacklist_file {
        Some(path) => Ok(BlacklistRegistry::load(path)?),
        None => {
            warn!("No blacklist configured, every address is eligible for probing");
            Ok(BlacklistRegistry::empty())
        }
    }
}

/// Logs a fatal error before it ends the process.
fn fatal(e: PipelineError) -> anyhow::Error {
    error!("Fatal: {e}");
    e.into()
}

/// Flags cancellation on Ctrl-C or SIGTERM. The pipeline stops at the next
/// phase boundary.
async fn shutdown_handler(cancel: Arc<AtomicBool>) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Shutdown requested, finishing the current phase");
    cancel.store(true, Ordering::SeqCst);
}
