mod calibrate;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use calibrate::StdinOperator;
use energy_insight::{
    capture_path, host_identity, AcquisitionDriver, CalibrationSession, ConfigStore, CsvReportRenderer, InfluxSink, MemorySink,
    MeterConfig, MeterEngine, MeterError, ReplayAdc, SessionEnd, SignalProfile, SimulatedAdc, SpiHelperAdc,
    SystemClock, TimeSeriesSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Continuous metering, rounds written to InfluxDB
    Run,
    /// One cycle per phase, printed and dumped to CSV
    Debug,
    /// Interactive CT phase calibration
    Calibration,
    /// Measure acquisition throughput only
    Speedtest,
}

/// Multi-phase CT energy meter
#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-phase CT energy meter", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Synthesise samples instead of reading from hardware
    #[arg(short, long)]
    simulate: bool,

    /// Replay a recorded capture, or a directory of capture-phase{N}.bin files, instead of reading from hardware
    #[arg(long, conflicts_with = "simulate")]
    replay: Option<PathBuf>,

    /// Log points instead of writing them to InfluxDB
    #[arg(long)]
    dry_run: bool,

    /// SPI helper binary used to read the MCP3008
    #[arg(long, default_value = "mcp3008hwspi")]
    helper: PathBuf,

    #[arg(value_enum)]
    mode: Mode,
}

fn build_drivers(args: &Args, config: &MeterConfig) -> Result<Vec<Box<dyn AcquisitionDriver>>> {
    let table = config.calibration_table();
    let bias_counts = (config.general.adc_resolution / 2.0).round() as i32;

    table
        .phases
        .iter()
        .enumerate()
        .map(|(phase, calibration)| -> Result<Box<dyn AcquisitionDriver>> {
            if args.simulate {
                let profile = SignalProfile {
                    frequency: config.general.frequency,
                    ..Default::default()
                };
                Ok(Box::new(
                    SimulatedAdc::new(profile, calibration.clone(), bias_counts, config.general.sample_rate).paced(true),
                ))
            } else if let Some(path) = &args.replay {
                let path = capture_path(path, phase);
                let adc = ReplayAdc::open(&path).with_context(|| format!("opening capture {}", path.display()))?;
                Ok(Box::new(adc))
            } else {
                Ok(Box::new(SpiHelperAdc::new(&args.helper, phase as u32)))
            }
        })
        .collect()
}

fn register_shutdown() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;
    Ok(shutdown)
}

fn calibration(args: &Args, mut store: ConfigStore) -> Result<()> {
    let mut drivers = build_drivers(args, store.config())?;
    let mut renderer = CsvReportRenderer::new(store.config().calibration.report_dir.clone());
    let mut input = StdinOperator::new();

    let mut session = CalibrationSession::new(&mut store, &mut drivers);
    match session.run(&mut input, &mut renderer) {
        Ok(SessionEnd::Completed(report)) => {
            log::info!(
                "Calibration of CT{} on phase {} finished, shift {:.6} rad",
                report.ct,
                report.phase,
                report.applied_shift
            );
            Ok(())
        }
        Ok(SessionEnd::Aborted) => {
            log::info!("Calibration aborted");
            Ok(())
        }
        Err(e @ MeterError::InstallationFault { .. }) => {
            log::error!("{}", e);
            log::error!("Check the CT orientation and make sure the load is purely resistive, then try again.");
            Ok(())
        }
        Err(e) => Err(e).context("calibration failed"),
    }
}

fn meter(args: &Args, store: ConfigStore) -> Result<()> {
    let shutdown = register_shutdown()?;
    let drivers = build_drivers(args, store.config())?;

    let sink: Box<dyn TimeSeriesSink> = if args.dry_run || args.mode != Mode::Run {
        Box::new(MemorySink::echoing())
    } else {
        Box::new(InfluxSink::new(&store.config().influx)?)
    };

    // Debug and speedtest never write totals back
    let store = if args.mode == Mode::Run { store } else { store.detached() };
    let mut engine = MeterEngine::new(store, drivers, sink, Box::new(SystemClock), shutdown, host_identity())?;

    match args.mode {
        Mode::Debug => engine.debug_cycle(&std::env::current_dir()?)?,
        Mode::Speedtest => engine.speedtest()?,
        _ => {
            log::info!("... Press Ctrl-C to quit...");
            engine.run()?;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let store = ConfigStore::open(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;

    if args.simulate {
        log::info!("Simulating signals instead of reading from hardware.");
    } else if let Some(path) = &args.replay {
        log::info!("Replaying capture {}", path.display());
    }

    match args.mode {
        Mode::Calibration => calibration(&args, store),
        _ => meter(&args, store),
    }
}
