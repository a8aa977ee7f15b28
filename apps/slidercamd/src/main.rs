//! Runs the slidercam rig and serves its operations on stdin/stdout.
//!
//! ```sh
//! cargo run -p slidercamd -- --config slidercam.ron
//! cargo run -p slidercamd -- --sim --data-dir /tmp/slidercam
//! ```
//!
//! Requests and responses are JSON, one per line. Logs go to stderr and,
//! with `--log-file`, to a file as well.

mod console;

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, info, warn};
use cu29_clock::RobotClock;
use sc_control::{Poller, SliderRig, SystemConfig};
use sc_dynamixel::{BusGateway, SimBus, open_serial};
use simplelog::{ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser)]
#[command(name = "slidercamd", version, about = "Camera slider servo controller")]
struct Args {
    /// RON configuration; the stock six-axis rig when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Overrides `bus.device`.
    #[arg(long)]
    device: Option<String>,
    /// Run against the simulated bus instead of a serial port.
    #[arg(long)]
    sim: bool,
    /// Overrides `data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(level: LevelFilter, file: Option<&Path>) -> anyhow::Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];
    if let Some(path) = file {
        let f = File::create(path).with_context(|| format!("creating log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, Config::default(), f));
    }
    CombinedLogger::init(loggers).context("installing logger")?;
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<SystemConfig> {
    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if let Some(device) = &args.device {
        config.bus.device = device.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn open_bus(config: &SystemConfig, sim: bool, clock: &RobotClock) -> anyhow::Result<Box<dyn BusGateway>> {
    if sim {
        info!("using the simulated bus");
        return Ok(Box::new(SimBus::new(config.motors.iter().map(|m| m.id), clock.clone())));
    }
    let bus = open_serial(&config.bus.device, config.bus.baud, config.bus.timeout()).with_context(|| {
        format!(
            "opening {} (adapter plugged in? user in the dialout group?)",
            config.bus.device
        )
    })?;
    Ok(Box::new(bus))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level, args.log_file.as_deref())?;

    let config = load_config(&args)?;
    let clock = RobotClock::new();
    let bus = open_bus(&config, args.sim, &clock)?;
    let rig = Arc::new(SliderRig::new(config.clone(), bus, clock).context("opening the data directory")?);

    let failures = rig.initialize();
    if failures.is_empty() {
        info!("{} motors online", config.motors.len());
    }
    for f in failures {
        warn!("{f}");
    }

    let poller = Poller::spawn(Arc::clone(&rig), config.tick()).context("starting the poller")?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::Relaxed)).context("installing the Ctrl-C handler")?;

    console::serve(&rig, &running)?;

    drop(poller);
    rig.stop_playback();
    rig.stop_tracking();
    info!("slidercamd stopped");
    Ok(())
}
