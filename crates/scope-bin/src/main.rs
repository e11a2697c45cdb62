//! `scope-scan` command line.
//!
//! Loads a scan configuration, wires the stage and camera drivers to a
//! [`ScanOrchestrator`] and runs one scan. The final `ScanRun` is printed to
//! stdout, either as a short summary or as JSON for the persistence side.
//!
//! # Usage
//!
//! Simulated hardware:
//! ```bash
//! scope-scan run --config scan.toml --simulated
//! ```
//!
//! Stage board on a serial port, frames written as TIFF files:
//! ```bash
//! scope-scan run --config scan.toml --port /dev/ttyUSB0 --output ./fields --json
//! ```
//!
//! Ctrl-C stops the scan at the next step boundary; teardown still runs.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tracing::{info, warn, Level};

use scope_core::capabilities::{CameraDriver, StageDriver};
use scope_core::config::ScanConfiguration;
use scope_driver_mock::{ErrorConfig, MockMode, SimulatedCamera, SimulatedStage, SpecimenKind};
use scope_driver_serial::{SerialStage, DEFAULT_BAUD_RATE};
use scope_scan::{
    DirectoryImageSink, FieldOutcome, ImageSink, MemoryImageSink, ScanEvent, ScanOrchestrator,
    ScanRun,
};

use logging::{OutputFormat, TracingConfig};

#[derive(Parser)]
#[command(name = "scope-scan")]
#[command(about = "Automated slide scanning with per-field autofocus", long_about = None)]
struct Cli {
    /// Default log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info", value_parser = logging::parse_log_level)]
    log_level: Level,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scan
    Run(RunArgs),

    /// Load and validate a configuration, print it resolved
    Check {
        /// Scan configuration (TOML)
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Scan configuration (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Use the simulated stage
    #[arg(long, conflicts_with = "port")]
    simulated: bool,

    /// Serial port of the stage board
    #[arg(long)]
    port: Option<String>,

    /// Stage board baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Timing model of the simulated devices
    #[arg(long, value_enum, default_value_t = Simulation::Realistic)]
    simulation: Simulation,

    /// Per-command failure probability in chaos simulation
    #[arg(long, default_value_t = 0.01)]
    failure_rate: f64,

    /// Seed for the simulated devices
    #[arg(long)]
    seed: Option<u64>,

    /// Specimen shown by the simulated camera
    #[arg(long, value_enum, default_value_t = Specimen::Brightfield)]
    specimen: Specimen,

    /// Directory for captured frames. Frames stay in memory when omitted.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the full run record as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Simulation {
    Instant,
    Realistic,
    Chaos,
}

impl From<Simulation> for MockMode {
    fn from(mode: Simulation) -> Self {
        match mode {
            Simulation::Instant => MockMode::Instant,
            Simulation::Realistic => MockMode::Realistic,
            Simulation::Chaos => MockMode::Chaos,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Specimen {
    Brightfield,
    Fluorescent,
    Blank,
}

impl From<Specimen> for SpecimenKind {
    fn from(specimen: Specimen) -> Self {
        match specimen {
            Specimen::Brightfield => SpecimenKind::Brightfield,
            Specimen::Fluorescent => SpecimenKind::Fluorescent,
            Specimen::Blank => SpecimenKind::Blank,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = TracingConfig::new(cli.log_level).with_format(cli.log_format);
    if let Err(e) = logging::init(tracing) {
        eprintln!("{:#}", e);
    }

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check { config } => check(config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load(path: &Path) -> Result<ScanConfiguration> {
    // figment treats a missing file as an empty source
    if !path.is_file() {
        bail!("configuration file {} not found", path.display());
    }
    ScanConfiguration::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

fn check(path: PathBuf) -> Result<ExitCode> {
    let config = load(&path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(ExitCode::SUCCESS)
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = load(&args.config)?;
    let mode = MockMode::from(args.simulation);
    let faults = || match mode {
        MockMode::Chaos => ErrorConfig::random_failures_seeded(args.failure_rate, args.seed),
        _ => ErrorConfig::none(),
    };

    let stage: Arc<dyn StageDriver> = match args.port.as_deref().filter(|_| !args.simulated) {
        Some(port) => {
            let stage = SerialStage::new_async(port, args.baud)
                .await
                .with_context(|| format!("opening stage board on {}", port))?;
            info!(port = %port, baud = args.baud, "using stage board");
            Arc::new(stage)
        }
        None => {
            info!(?mode, "using simulated stage");
            Arc::new(
                SimulatedStage::builder()
                    .mode(mode)
                    .error_config(faults())
                    .build(),
            )
        }
    };

    let mut camera = SimulatedCamera::builder()
        .mode(mode)
        .specimen_kind(args.specimen.into())
        .error_config(faults());
    if let Some(seed) = args.seed {
        camera = camera.seed(seed);
    }
    let camera: Arc<dyn CameraDriver> = Arc::new(camera.build());

    let sink: Arc<dyn ImageSink> = match &args.output {
        Some(dir) => Arc::new(DirectoryImageSink::new(dir)),
        None => Arc::new(MemoryImageSink::new()),
    };

    let orchestrator = Arc::new(ScanOrchestrator::new(stage, camera, sink));

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping scan");
            stop.request_stop();
        }
    });

    let progress = (!args.json).then(|| tokio::spawn(print_progress(orchestrator.subscribe())));

    let run = orchestrator.run(config).await?;

    if let Some(task) = progress {
        task.abort();
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_summary(&run);
    }

    Ok(if run.outcome.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn print_progress(mut events: broadcast::Receiver<ScanEvent>) {
    loop {
        match events.recv().await {
            Ok(ScanEvent::Field { result, .. }) => {
                eprintln!(
                    "field ({}, {}) {:?} focus={:.3} attempts={}",
                    result.position.row,
                    result.position.column,
                    result.outcome,
                    result.focus_metric,
                    result.autofocus_attempts
                );
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "progress display fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn print_summary(run: &ScanRun) {
    println!("run {}", run.id);
    match run.outcome.reason() {
        None => println!("outcome: completed"),
        Some(reason) => println!("outcome: stopped ({})", reason),
    }
    println!(
        "fields: {} visited, {} captured, {} autofocus failed, {} stage faults",
        run.fields.len(),
        run.count(FieldOutcome::Captured),
        run.count(FieldOutcome::AutofocusFailed),
        run.count(FieldOutcome::StageFault),
    );
    println!("images: {}", run.images());
    println!("autofocus failures: {}", run.autofocus_failures);
    println!(
        "duration: {:.1}s",
        (run.finished_at - run.started_at).num_milliseconds() as f64 / 1000.0
    );
}
