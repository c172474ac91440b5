//! Command-line entry point for gyroscope characterization runs.
//!
//! ```text
//! fog_daq --simulate calibrate
//! fog_daq --simulate acquire --hours 2 --store runs --key night1
//! fog_daq analyze --store runs --key night1 --json
//! fog_daq list --store runs
//! ```
//!
//! Logging follows `RUST_LOG` when set, and the configured
//! `application.log_level` otherwise.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fog_daq::acquisition::{AcquisitionController, PersistenceStatus, SaveTarget};
use fog_daq::calibration::ScaleFactorCalibrator;
use fog_daq::config::{AcquisitionDuration, Settings};
use fog_daq::data::run::{adev, drift, noise};
use fog_daq::data::storage::{attr, AttrValue, DirectoryStore, RunStore, WriteMode};
use fog_daq::instrument::sim::{SimBench, SimConfig};
use fog_daq::instrument::{abort_pair, AbortSignal, InstrumentSet};
use fog_daq::units::{parse_duration_seconds, VoltageUnit};

#[derive(Parser, Debug)]
#[command(name = "fog_daq", version, about = "Fiber-optic gyroscope calibration and noise analysis")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Drive the simulated bench instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dither calibration and print the scale factor
    Calibrate {
        #[arg(long)]
        json: bool,
    },
    /// Calibrate, acquire and optionally save a run
    Acquire(AcquireArgs),
    /// Print Allan statistics for a stored run
    Analyze {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        key: String,
        /// Unit for voltage attributes
        #[arg(long, default_value = "mV")]
        voltage_unit: VoltageUnit,
        #[arg(long)]
        json: bool,
    },
    /// List stored runs
    List {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Delete a stored run
    Delete {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        key: String,
    },
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Run directory; defaults to `storage.path`
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AcquireArgs {
    #[arg(long, default_value_t = 0.0)]
    seconds: f64,
    #[arg(long, default_value_t = 0.0)]
    minutes: f64,
    #[arg(long, default_value_t = 0.0)]
    hours: f64,
    /// Total duration with a unit, e.g. `90s`, `15min`, `2h`; added to the above
    #[arg(long)]
    duration: Option<String>,
    #[command(flatten)]
    store: StoreArgs,
    /// Key to save under; defaults to `storage.key`
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    overwrite: bool,
}

impl AcquireArgs {
    fn duration(&self) -> Result<AcquisitionDuration> {
        let extra = match &self.duration {
            Some(text) => parse_duration_seconds(text)?,
            None => 0.0,
        };
        Ok(AcquisitionDuration {
            seconds: self.seconds + extra,
            minutes: self.minutes,
            hours: self.hours,
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(2);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(cli, settings).await {
        error!("{err:#}");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    match cli.command {
        Command::Calibrate { json } => {
            let (_bench, mut instruments) = instruments(cli.simulate)?;
            let abort = abort_on_ctrl_c();
            let calibrator = ScaleFactorCalibrator::new(settings.calibration_config())?;
            let result = calibrator.calibrate(&mut instruments, &abort).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Scale factor: {:.3} deg/hr per V", result.scale_factor);
            }
        }
        Command::Acquire(args) => acquire(&settings, cli.simulate, args).await?,
        Command::Analyze {
            store,
            key,
            voltage_unit,
            json,
        } => {
            let store = open_store(&settings, &store)?;
            analyze(&store, &key, voltage_unit, json)?;
        }
        Command::List { store } => {
            let store = open_store(&settings, &store)?;
            for (key, run) in store.items()? {
                println!(
                    "{key}\t{} samples\t{:.3} Hz\t{}",
                    run.len(),
                    run.rate(),
                    run.start().map_or_else(|| "-".to_string(), |s| s.to_rfc3339())
                );
            }
        }
        Command::Delete { store, key } => {
            open_store(&settings, &store)?.delete(&key)?;
            println!("Deleted '{key}'");
        }
    }
    Ok(())
}

async fn acquire(settings: &Settings, simulate: bool, args: AcquireArgs) -> Result<()> {
    // Reject an empty duration before any instrument is opened
    let duration = args.duration()?;
    duration.total_seconds()?;

    let store_path = args
        .store
        .store
        .clone()
        .or_else(|| settings.storage.path.clone());
    let key = args.key.clone().or_else(|| settings.storage.key.clone());
    let store = match (&store_path, &key) {
        (Some(path), Some(_)) => Some(RunStore::<DirectoryStore>::open(path)?),
        (Some(_), None) => bail!("a store path was given without a --key to save under"),
        _ => None,
    };

    let (_bench, mut instruments) = instruments(simulate)?;
    let abort = abort_on_ctrl_c();
    let controller = AcquisitionController::new(
        ScaleFactorCalibrator::new(settings.calibration_config())?,
        settings.acquisition_config(),
    )?;

    let mut progress = controller.subscribe_progress();
    let progress_task = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = *progress.borrow_and_update();
            info!("Acquiring {}", current.label());
        }
    });

    let save = match (&store, &key) {
        (Some(store), Some(key)) => Some(SaveTarget {
            store,
            key,
            mode: WriteMode::from_overwrite_flag(args.overwrite || settings.storage.overwrite),
            environment: settings.environment,
        }),
        _ => None,
    };
    let report = controller
        .run(&mut instruments, duration, &abort, save)
        .await;
    progress_task.abort();
    let report = report?;

    let session = &report.session;
    println!("Scale factor: {:.3} deg/hr per V", session.scale_factor());
    println!(
        "Samples: {} at {:.4} Hz",
        session.voltage().len(),
        session.effective_rate()
    );
    if let Some(point) = session.curve().first() {
        println!("ARW: {:.6} deg/rt-hr", point.sigma / fog_daq::units::ARW_DIVISOR);
    }
    if let Some(point) = session.curve().min_sigma() {
        println!("Bias drift: {:.6} deg/hr at tau {:.1} s", point.sigma, point.tau);
    }

    match (report.persistence, key) {
        (PersistenceStatus::NotRequested, _) => {}
        (PersistenceStatus::Saved, Some(key)) => println!("Saved as '{key}'"),
        (PersistenceStatus::Skipped, Some(key)) => {
            warn!("'{key}' already exists; rerun with --overwrite to replace it");
        }
        (PersistenceStatus::Failed(message), _) => {
            warn!("Run was acquired but not saved: {message}");
        }
        (status, None) => warn!(?status, "Unexpected persistence status without a key"),
    }
    Ok(())
}

fn analyze(
    store: &RunStore<DirectoryStore>,
    key: &str,
    voltage_unit: VoltageUnit,
    json: bool,
) -> Result<()> {
    let run = store.get(key)?;
    let attributes = store.attributes(key)?;
    let curve = adev(&run);

    if json {
        let report = json!({
            "key": key,
            "samples": run.len(),
            "rate": run.rate(),
            "start": run.start(),
            "scale_factor": run.scale_factor(),
            "noise": noise(&run),
            "drift": drift(&run),
            "tau": curve.taus(),
            "sigma": curve.sigmas(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{key}: {} samples at {:.4} Hz", run.len(), run.rate());
    if let Some(scale) = run.scale_factor() {
        println!("  scale factor  {scale:.3} deg/hr per V");
    }
    if let Some(AttrValue::Float(volts)) = attributes.get(attr::SENSITIVITY) {
        println!(
            "  sensitivity   {} {}",
            voltage_unit.from_volts(*volts),
            voltage_unit
        );
    }
    match (noise(&run), drift(&run)) {
        (Some(arw), Some(bias)) => {
            println!("  ARW           {arw:.6} deg/rt-hr");
            println!("  bias drift    {bias:.6} deg/hr");
        }
        _ => println!("  run too short for Allan statistics"),
    }
    for point in curve.points() {
        println!("  {:>12.4} s  {:.6e}", point.tau, point.sigma);
    }
    Ok(())
}

fn open_store(settings: &Settings, args: &StoreArgs) -> Result<RunStore<DirectoryStore>> {
    let path: &Path = args
        .store
        .as_deref()
        .or(settings.storage.path.as_deref())
        .context("no run store given; pass --store or set storage.path")?;
    Ok(RunStore::open(path)?)
}

/// Instrument handles for this process, keeping the simulated bench alive.
fn instruments(simulate: bool) -> Result<(SimBench, InstrumentSet)> {
    if !simulate {
        bail!("no hardware driver is configured in this build; rerun with --simulate");
    }
    let bench = SimBench::new(SimConfig::default())?;
    let instruments = bench.instrument_set();
    Ok((bench, instruments))
}

fn abort_on_ctrl_c() -> AbortSignal {
    let (handle, signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping the run");
            handle.abort();
        }
    });
    signal
}
