//! CLI entry point for ion-daq.
//!
//! Provides a command-line interface for:
//! - Running a scan against the software sequencer (`simulate`)
//! - Printing the contents of a trace file (`inspect`)
//!
//! # Usage
//!
//! Run a scan described in a TOML file:
//! ```bash
//! ion_daq simulate --scan scans/rabi.toml
//! ```
//!
//! Run a quick 20 point linear scan:
//! ```bash
//! ion_daq simulate --points 20 --stop 19
//! ```
//!
//! Inspect a trace:
//! ```bash
//! ion_daq inspect data/rabi_001.txt
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use ion_daq::config::EngineConfig;
use ion_daq::evaluation::{Algorithm, EvaluationDefinition};
use ion_daq::interlock::InterlockGate;
use ion_daq::logging;
use ion_daq::persistence::ConfigStore;
use ion_daq::pulser::program::{ProgramVariable, ValueEncoding};
use ion_daq::pulser::simulator::{SimulatedSequencer, SimulatorOptions};
use ion_daq::pulser::PulseProgram;
use ion_daq::scan::{EventKind, ScanController, ScanDescriptor, ScanEvent, ScanRunner};
use ion_daq::trace::{TraceCollection, TraceFormat};

#[derive(Parser)]
#[command(name = "ion_daq")]
#[command(about = "Trapped-ion experiment execution engine", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true, default_value = ion_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan against the simulated sequencer
    Simulate {
        /// Scan file (TOML with `[scan]`, `[[evaluations]]` and optional `[program]`)
        #[arg(long)]
        scan: Option<PathBuf>,

        /// Points of the default linear scan
        #[arg(long, default_value = "10")]
        points: usize,

        /// First x of the default linear scan
        #[arg(long, default_value = "0")]
        start: f64,

        /// Last x of the default linear scan
        #[arg(long, default_value = "9")]
        stop: f64,

        /// Repeats of the scan
        #[arg(long, default_value = "1")]
        repeats: usize,

        /// Wall time per simulated point in milliseconds
        #[arg(long, default_value = "1")]
        point_ms: u64,

        /// Trace format (text, zip, hdf5); overrides the configuration
        #[arg(long)]
        format: Option<TraceFormat>,

        /// Output directory; overrides the configuration
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print header and column statistics of a trace file
    Inspect {
        /// Trace file
        path: PathBuf,
    },
}

/// Scan file layout.
#[derive(Debug, Deserialize)]
struct ScanFile {
    scan: ScanDescriptor,
    #[serde(default)]
    evaluations: Vec<EvaluationDefinition>,
    #[serde(default)]
    program: Option<PulseProgram>,
    #[serde(default)]
    overrides: BTreeMap<String, f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load_from(&cli.config)?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Simulate {
            scan,
            points,
            start,
            stop,
            repeats,
            point_ms,
            format,
            output,
        } => {
            let mut config = config;
            if let Some(format) = format {
                config.storage.format = format;
            }
            if let Some(output) = output {
                config.storage.output_dir = output;
            }
            let mut file = match scan {
                Some(path) => load_scan_file(&path)?,
                None => default_scan(points, start, stop),
            };
            // --repeats only overrides when given
            if repeats != 1 {
                file.scan.repeats = repeats;
            }
            simulate(config, file, Duration::from_millis(point_ms)).await
        }
        Commands::Inspect { path } => inspect(&path),
    }
}

fn load_scan_file(path: &Path) -> Result<ScanFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading scan file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing scan file {}", path.display()))
}

fn default_scan(points: usize, start: f64, stop: f64) -> ScanFile {
    ScanFile {
        scan: ScanDescriptor::linear("simulated", "cycles", start, stop, points),
        evaluations: vec![EvaluationDefinition::new("counts", 0, Algorithm::MeanCount)],
        program: None,
        overrides: BTreeMap::new(),
    }
}

/// Program with one raw variable per scan parameter.
fn default_program(scan: &ScanDescriptor) -> PulseProgram {
    let program = PulseProgram::new("simulated", vec![0; 64]);
    if scan.parameter.is_empty() {
        return program;
    }
    program.with_variable(
        scan.parameter.clone(),
        ProgramVariable {
            address: 0,
            value: 0.0,
            encoding: ValueEncoding::Raw,
        },
    )
}

async fn simulate(config: EngineConfig, file: ScanFile, point_duration: Duration) -> Result<()> {
    let simulator = SimulatedSequencer::new(SimulatorOptions {
        point_duration,
        shots: 50,
        ..Default::default()
    });
    let (pulser, queue) = simulator.connect(&config.pulser)?;
    let program = file
        .program
        .unwrap_or_else(|| default_program(&file.scan));
    let store = Arc::new(ConfigStore::open(&config.storage.config_store)?);

    let controller = ScanController::new(Arc::new(pulser), program, config)?
        .with_queue(queue)
        .with_store(store);
    let gate = InterlockGate::new();
    let (handle, task) = ScanRunner::spawn(controller, Some(gate.subscribe()));

    let mut events = handle.subscribe_to(&[
        EventKind::Progress,
        EventKind::Interrupted,
        EventKind::Finalized,
    ]);
    info!(scan = %file.scan.name, "starting simulated scan");
    handle.start(file.scan, file.evaluations, file.overrides).await?;

    let outcome = loop {
        match events.next().await {
            Some(ScanEvent::Progress { current, total }) => {
                let total = total.map_or("∞".to_string(), |t| t.to_string());
                println!("point {current}/{total}");
            }
            Some(ScanEvent::Interrupted { reason }) => {
                eprintln!("scan interrupted: {reason}");
                handle.stop(reason).await?;
            }
            Some(ScanEvent::Finalized { path, reason }) => break Some((path, reason)),
            Some(_) => {}
            None => break None,
        }
    };
    handle.shutdown().await?;
    task.await?;

    match outcome {
        Some((Some(path), reason)) => {
            println!("scan finished ({reason}): {}", path.display());
            Ok(())
        }
        Some((None, reason)) => bail!("scan ended without saving: {reason}"),
        None => bail!("scan controller stopped unexpectedly"),
    }
}

fn inspect(path: &Path) -> Result<()> {
    let collection = TraceCollection::load(path)
        .with_context(|| format!("loading trace {}", path.display()))?;
    println!("{}", collection.name());
    for (key, value) in &collection.description {
        println!("  {key} ({}) = {value:?}", value.type_name());
    }
    for trace in collection.traces() {
        println!("trace '{}': {} rows", trace.name(), trace.len());
        for column in trace.column_names() {
            match trace.statistics(column) {
                Some(stats) => println!(
                    "  {column:<14} n={:<6} min={:<12.6} max={:<12.6} mean={:.6}",
                    stats.count, stats.min, stats.max, stats.mean
                ),
                None => println!("  {column:<14} (empty)"),
            }
        }
    }
    for name in collection.structured_data().keys() {
        println!("structured data '{name}'");
    }
    Ok(())
}
