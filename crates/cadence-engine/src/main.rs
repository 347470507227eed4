//! `cadence` binary: run a scenario or inspect a snapshot.
//!
//! # Run sequence
//!
//! 1. Load configuration (file or defaults), apply environment overrides
//! 2. Initialize structured logging (tracing)
//! 3. Load and validate the scenario
//! 4. Open the telemetry stream
//! 5. Assemble the simulation and optionally resume from a snapshot
//! 6. Run until a bound, the run-until condition or Ctrl-C
//! 7. Log the result and optionally write a final snapshot

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use cadence_core::checkpoint::latest_checkpoint;
use cadence_core::config::LoggingConfig;
use cadence_core::{
    CadenceConfig, RunControl, Simulation, Snapshot, TickCallback, TickSummary, log_simulation_end,
    run_simulation,
};
use cadence_engine::{EngineError, Scenario, build_simulation, run_bounds};
use cadence_events::{JsonLinesTelemetry, Telemetry};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Deterministic simulation orchestration core.
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Run simulation scenarios and inspect snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario.
    Run(RunArgs),

    /// Print a summary of a snapshot file.
    Inspect {
        /// Snapshot file (`.json` or `.json.gz`).
        snapshot: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Scenario file (YAML, or JSON with a `.json` extension).
    #[arg(long, short = 's')]
    scenario: PathBuf,

    /// Configuration file. Defaults apply when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Ticks to run, overriding the scenario and configuration.
    #[arg(long)]
    ticks: Option<u64>,

    /// Seed, overriding the scenario and configuration.
    #[arg(long)]
    seed: Option<u64>,

    /// Resume from a snapshot file, or from the newest checkpoint in a
    /// directory.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Append telemetry to this JSON-lines file.
    #[arg(long)]
    telemetry: Option<PathBuf>,

    /// Write a snapshot here once the run ends.
    #[arg(long)]
    final_snapshot: Option<PathBuf>,

    /// Log a progress line every N ticks (0 = only at debug level).
    #[arg(long, default_value_t = 10)]
    progress_every: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Inspect { snapshot } => inspect(&snapshot),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    // 1. Load configuration.
    let mut config = load_config(args.config.as_deref())?;
    if let Some(path) = args.telemetry {
        config.telemetry.path = Some(path);
    }

    // 2. Initialize structured logging.
    init_logging(&config.logging)?;
    info!(
        name = %config.simulation.name,
        seed = config.simulation.seed,
        unit_timeout_ms = config.scheduler.unit_timeout_ms,
        failure_threshold = config.scheduler.failure_threshold,
        checkpoint_interval = config.checkpoint.interval,
        "Configuration loaded"
    );

    // 3. Load the scenario.
    let mut scenario = Scenario::load(&args.scenario).map_err(EngineError::from)?;
    if args.seed.is_some() {
        scenario.seed = args.seed;
    }

    // 4. Open the telemetry stream.
    let telemetry = match &config.telemetry.path {
        Some(path) => {
            let sink = JsonLinesTelemetry::open(path).map_err(EngineError::from)?;
            info!(path = %path.display(), "Telemetry stream opened");
            Telemetry::new(Arc::new(sink))
        }
        None => Telemetry::null(),
    };

    // 5. Assemble the simulation.
    let mut sim = build_simulation(&scenario, &config, telemetry).map_err(EngineError::from)?;
    if let Some(path) = &args.resume {
        resume(&mut sim, path).with_context(|| format!("cannot resume from {}", path.display()))?;
    }
    let bounds = run_bounds(&scenario, &config, args.ticks).map_err(EngineError::from)?;

    // 6. Run, stopping cleanly on Ctrl-C.
    let control = Arc::new(RunControl::new(config.simulation.tick_interval_ms));
    let signal_control = Arc::clone(&control);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current tick");
            signal_control.request_stop();
        }
    });

    let mut callback = ProgressCallback {
        every: args.progress_every,
    };
    let result = run_simulation(&mut sim, &control, &bounds, &mut callback)
        .await
        .map_err(EngineError::from)?;

    // 7. Log results.
    log_simulation_end(&result);

    if let Some(path) = &args.final_snapshot {
        let snapshot = sim.snapshot().map_err(EngineError::from)?;
        snapshot.save(path).map_err(EngineError::from)?;
        info!(path = %path.display(), tick = snapshot.tick, "Final snapshot written");
    }

    info!(
        end_reason = ?result.end_reason,
        total_ticks = result.total_ticks,
        elapsed_seconds = control.elapsed_seconds(),
        "cadence shutdown complete"
    );
    Ok(())
}

/// Load configuration from `path`, or defaults plus environment
/// overrides when no file is given.
fn load_config(path: Option<&Path>) -> Result<CadenceConfig, EngineError> {
    if let Some(path) = path {
        return Ok(CadenceConfig::from_file(path)?);
    }
    let mut config = CadenceConfig::default();
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) -> Result<(), EngineError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let initialized = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    initialized.map_err(|e| EngineError::Logging {
        message: e.to_string(),
    })
}

fn resume(sim: &mut Simulation, path: &Path) -> Result<(), EngineError> {
    let file = if path.is_dir() {
        latest_checkpoint(path)?.ok_or_else(|| EngineError::NoCheckpoint {
            directory: path.to_path_buf(),
        })?
    } else {
        path.to_path_buf()
    };
    let snapshot = Snapshot::load(&file)?;
    sim.restore(snapshot)?;
    info!(path = %file.display(), tick = sim.tick(), "Resumed from snapshot");
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotSummary {
    format_version: u32,
    run_id: String,
    created_at: String,
    tick: u64,
    entities: usize,
    records: usize,
    units: usize,
    next_action_key: u64,
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let snapshot = Snapshot::load(path).with_context(|| format!("cannot load {}", path.display()))?;
    let summary = SnapshotSummary {
        format_version: snapshot.format_version,
        run_id: snapshot.run_id.to_string(),
        created_at: snapshot.created_at.to_rfc3339(),
        tick: snapshot.tick,
        entities: snapshot.entity_count(),
        records: snapshot.entities.iter().map(|e| e.records.len()).sum(),
        units: snapshot.scheduler.0.len(),
        next_action_key: snapshot.next_action_key,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Logs a progress line every `every` ticks and every fault as it occurs.
struct ProgressCallback {
    every: u64,
}

impl TickCallback for ProgressCallback {
    fn on_tick(&mut self, summary: &TickSummary, sim: &Simulation) {
        for fault in &summary.faults {
            warn!(tick = summary.tick, fault = %fault, "Fault");
        }
        for unit in &summary.disabled {
            warn!(tick = summary.tick, unit = %unit, "Unit disabled");
        }
        let due = summary
            .tick
            .checked_add(1)
            .and_then(|completed| completed.checked_rem(self.every))
            == Some(0);
        if due {
            info!(
                tick = summary.tick,
                entities = summary.entities,
                proposed = summary.proposed,
                resolved = summary.resolved,
                background_pending = summary.background_pending,
                in_flight = sim.protocol().in_flight(),
                "Progress"
            );
        } else {
            debug!(tick = summary.tick, units_run = summary.units_run, "Tick complete");
        }
    }
}
