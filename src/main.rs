//! CLI entry point for teng-daq
//!
//! - `run`: record sessions on simulated hardware, driven by a config file
//! - `merge`: offline concatenation and alignment of a measurement folder
//!
//! # Usage
//!
//! ```bash
//! teng-daq run --config config/default.toml --duration 5
//! teng-daq merge data/session_20260101_120000_000 --exp-id EXP01 --config config/default.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn, Level};

use teng_daq::acquisition::{AcquisitionKind, ChannelTask, PlotTap};
use teng_daq::config::SessionConfig;
use teng_daq::handshake::HandshakeLines;
use teng_daq::hardware::mock::{MockAcquisitionDriver, MockLine, MockMode, MockPort, MockSignal, SimulatedController};
use teng_daq::merge::{merge_controller_parts, merge_stream_files, merge_task_parts, StreamMerger};
use teng_daq::session::{OutputLines, SessionEvent, SessionOrchestrator};
use teng_daq::tracing_setup::{self, TracingConfig};
use teng_daq::DaqError;

#[derive(Parser)]
#[command(name = "teng-daq")]
#[command(about = "TENG bench data acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record sessions on simulated hardware
    Run {
        /// Session configuration file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Seconds of motion per session
        #[arg(long, default_value = "5")]
        duration: f64,
    },

    /// Concatenate part files and align task streams in a folder
    Merge {
        /// Folder holding the part files
        dir: PathBuf,

        /// Experiment identifier used in output names
        #[arg(long)]
        exp_id: String,

        /// Take task keywords and merge columns from this config
        #[arg(long)]
        config: Option<PathBuf>,

        /// Task keywords, comma separated
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,

        /// Binary column bounding the valid window
        #[arg(long)]
        enable_column: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, duration } => run_sessions(&config, duration).await,
        Commands::Merge {
            dir,
            exp_id,
            config,
            keywords,
            enable_column,
        } => merge_folder(&dir, &exp_id, config.as_deref(), keywords, enable_column),
    }
}

fn load_config(path: &Path) -> Result<SessionConfig> {
    let config = SessionConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run_sessions(config_path: &Path, duration: f64) -> Result<()> {
    let config = load_config(config_path)?;
    tracing_setup::init_from_config(&config).map_err(|e| anyhow!(e))?;
    info!(config = %config_path.display(), "Initializing simulated bench");

    let trigger = MockLine::new(config.lines.trigger.clone());
    let controller = if config.remote.enabled {
        SimulatedController::new()
    } else {
        SimulatedController::new().unreachable()
    };
    let (bit0, bit1) = controller.status_lines();

    let enable_column = config.merge.enable_column.clone();
    let tasks = config.channel_groups().into_iter().map(|group| {
        let plot_capacity = config.plot_capacity(&group);
        let mut driver = MockAcquisitionDriver::new(MockMode::Realistic);
        for (idx, channel) in group.channels.iter().enumerate() {
            // Motion-related lines follow the trigger, like the motor's enable output.
            if channel.name == enable_column || group.kind == AcquisitionKind::DiscreteLine {
                driver = driver.with_signal(
                    idx,
                    MockSignal::FollowLine {
                        line: trigger.clone(),
                        high: 1.0,
                    },
                );
            }
        }
        ChannelTask::new(group, Box::new(driver), plot_capacity)
    });

    let (mut orchestrator, mut events) = SessionOrchestrator::builder(config.clone())
        .tasks(tasks)
        .handshake_lines(HandshakeLines {
            prepare: Arc::new(controller.prepare_line()),
            status_bit0: Arc::new(bit0),
            status_bit1: Arc::new(bit1),
        })
        .outputs(OutputLines {
            trigger: Arc::new(trigger),
            relay: Arc::new(MockPort::new(config.lines.relay_code.clone())),
        })
        .remote(Arc::new(controller))
        .build()
        .await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StopSucceeded(files) | SessionEvent::RunMerged(files) => {
                    for file in files {
                        info!(file = %file.display(), "Session output");
                    }
                }
                SessionEvent::StartFailed(reason)
                | SessionEvent::StopFailed(reason)
                | SessionEvent::MergeFailed(reason) => warn!(%reason, "Session event"),
                other => info!(event = ?other, "Session event"),
            }
        }
    });

    let taps = orchestrator.plot_taps();
    let motion = Duration::from_secs_f64(duration.max(0.0));
    let refresh = config.acquisition.refresh_interval();

    orchestrator.start().await?;
    loop {
        match record(&mut orchestrator, motion, refresh, &taps).await {
            Some(fault) => {
                if let Err(e) = orchestrator.handle_fault(fault).await {
                    warn!(error = %e, "Session aborted");
                }
            }
            None => {
                if let Err(e) = orchestrator.stop().await {
                    warn!(error = %e, "Session stopped with error");
                }
            }
        }
        // Automatic mode restarts by itself after the return delay.
        if !orchestrator.is_running() {
            break;
        }
    }

    if let Some(reason) = orchestrator.latched() {
        return Err(anyhow!("session latched: {}", reason));
    }
    Ok(())
}

/// Let one session run for `motion`, logging live-view statistics. Returns
/// early with a data-plane fault.
async fn record(
    orchestrator: &mut SessionOrchestrator,
    motion: Duration,
    refresh: Duration,
    taps: &[(String, PlotTap)],
) -> Option<DaqError> {
    let deadline = tokio::time::sleep(motion);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(refresh.max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            fault = orchestrator.next_fault() => return fault,
            _ = ticker.tick() => {
                for (task, tap) in taps {
                    if let Some(stats) = tap.lock().stats() {
                        debug!(
                            task = %task,
                            min = stats.min,
                            max = stats.max,
                            last = stats.last,
                            samples = stats.len,
                            "Live view"
                        );
                    }
                }
            }
        }
    }
}

fn merge_folder(
    dir: &Path,
    experiment_id: &str,
    config: Option<&Path>,
    mut keywords: Vec<String>,
    mut enable_column: Option<String>,
) -> Result<()> {
    let mut binary_columns = Vec::new();
    match config {
        Some(path) => {
            let config = load_config(path)?;
            tracing_setup::init_from_config(&config).map_err(|e| anyhow!(e))?;
            if keywords.is_empty() {
                keywords = config.channel_groups.iter().map(|g| g.name.clone()).collect();
            }
            if enable_column.is_none() && !config.merge.enable_column.is_empty() {
                enable_column = Some(config.merge.enable_column.clone());
            }
            binary_columns = config.merge.binary_columns.clone();
        }
        None => tracing_setup::init(TracingConfig::new(Level::INFO)).map_err(|e| anyhow!(e))?,
    }
    if keywords.is_empty() {
        return Err(anyhow!("no task keywords given, pass --keywords or --config"));
    }

    let outputs = merge_task_parts(dir, &keywords, experiment_id, dir)?;
    if let Some(motor) = merge_controller_parts(&dir.join("remote"), experiment_id, dir)? {
        info!(file = %motor.display(), "Controller log merged");
    }

    if let Some(enable_column) = enable_column {
        let merger = StreamMerger::new(enable_column).binary_columns(binary_columns);
        let output = dir.join(format!("DAQ-{}.csv", experiment_id));
        let merged = merge_stream_files(&merger, &outputs, &output)?;
        info!(file = %output.display(), rows = merged.len(), "Aligned dataset written");
    }
    Ok(())
}
