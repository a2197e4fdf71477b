//! `pumpprobe` command-line entry point.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pumpprobe_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use pumpprobe_daq::instrument::factory::build_handles;
use pumpprobe_daq::instrument::mock::MockInstrument;
use pumpprobe_daq::instrument::InstrumentHandle;
use pumpprobe_daq::observer::{spawn_observer, RunEvent, RunObserver};
use pumpprobe_daq::{logging, ResourceRegistry, RunCoordinator, RunHandle, RunOutcome, RunState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "pumpprobe")]
#[command(about = "STM pump-probe delay sweep sequencer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a configuration file and print the delay plan.
    Validate {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run the sweep against a mock instrument.
    Simulate {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Write the dataset here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Run the sweep against the configured instruments.
    Run {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

/// Logs progress as the run goes.
struct ProgressLog;

#[async_trait::async_trait]
impl RunObserver for ProgressLog {
    async fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::PointCompleted { point, total, .. } => {
                info!(
                    index = point.index,
                    total,
                    delay = point.delay,
                    aggregate = ?point.aggregate,
                    "point complete"
                );
            }
            RunEvent::PointFailed {
                point, will_retry, ..
            } => {
                warn!(index = point.index, will_retry, error = ?point.error(), "point failed");
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Simulate { config, output } => {
            let app = load(&config)?;
            let mock = Arc::new(MockInstrument::new("mock"));
            let handles = vec![InstrumentHandle::new("mock")
                .with_delay(mock.clone())
                .with_acquisition(mock.clone())
                .with_feedback(mock)];
            sweep(app, handles, output).await
        }
        Command::Run { config, output } => {
            let app = load(&config)?;
            let handles = build_handles(&app.instruments)
                .await
                .context("connecting instruments")?;
            sweep(app, handles, output).await
        }
    }
}

fn load(path: &Path) -> Result<AppConfig> {
    let app = AppConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    logging::init(&app.application.log_level, app.application.json_logs);
    Ok(app)
}

fn validate(path: PathBuf) -> Result<()> {
    let app = AppConfig::load_from(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    let plan = app.sweep.plan();
    println!("{}: {} points", path.display(), plan.len());
    for point in plan {
        println!("{:>6}  pass {:<3} delay {}", point.index, point.repeat, point.delay);
    }
    Ok(())
}

async fn sweep(app: AppConfig, handles: Vec<InstrumentHandle>, output: Option<PathBuf>) -> Result<()> {
    let coordinator =
        RunCoordinator::with_event_capacity(ResourceRegistry::new(), app.application.event_capacity);
    let observer = spawn_observer(coordinator.subscribe(), Arc::new(ProgressLog));

    let handle = coordinator
        .start(app.sweep, &handles)
        .context("starting run")?;
    info!(run_id = %handle.run_id(), "run started, Ctrl-C aborts");

    let outcome = wait(handle).await?;
    observer.await.context("progress observer")?;

    let json = serde_json::to_string_pretty(outcome.dataset.as_ref())?;
    match output {
        Some(path) => std::fs::write(&path, json)
            .with_context(|| format!("writing dataset to {}", path.display()))?,
        None => println!("{json}"),
    }

    for problem in &outcome.finalize_errors {
        warn!(%problem, "instrument not returned to a safe state");
    }
    match outcome.state {
        RunState::Completed | RunState::Aborted => Ok(()),
        _ => bail!(
            "run failed: {}",
            outcome.failure.as_deref().unwrap_or("unknown reason")
        ),
    }
}

/// Wait for the run, turning Ctrl-C into an abort request.
async fn wait(handle: RunHandle) -> Result<RunOutcome> {
    tokio::select! {
        _ = handle.wait_for_state(RunState::Finalizing) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            warn!("abort requested");
            let _ = handle.abort();
        }
    }
    Ok(handle.wait().await?)
}
