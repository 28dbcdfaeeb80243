use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use rust_dmx::{DmxPort, OfflineDmxPort, available_ports};
use simplelog::{Config as LogConfig, SimpleLogger};

use crate::config::{LoggingConfigSink, Snapshot};
use crate::daemon::{Daemon, LoggingPersistence};
use crate::dmx::UNIVERSE_COUNT;
use crate::hardware::gpio::parse_pin_mapping;
use crate::hardware::{Dmx, GpioIo, HardwareManager, Io, MockDmx, MockIo, PortDmx};

mod broadcast;
mod circadian;
mod color;
mod config;
mod daemon;
mod discovery;
mod dmx;
mod dtw;
mod error;
mod hardware;
mod output;
mod overrides;
mod resolver;
mod scenes;
mod store;
mod switches;
mod tick;
mod transitions;

/// BCM pins wired to switch inputs on the reference carrier board.
const DEFAULT_GPIO_INPUT_PINS: &str = "0:17,1:27,2:22,3:23,4:24,5:25,6:5,7:6";
/// Hardware-PWM-capable BCM pins.
const DEFAULT_GPIO_PWM_PINS: &str = "0:12,1:13,2:18,3:19";

const ARTNET_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(about)]
struct Cli {
    /// If true, provide verbose logging.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run(RunArgs),

    /// Check that the provided config file is valid, then quit.
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to a YAML file containing fixtures, groups, scenes, circadian
    /// profiles, switches, and system settings.
    config_file: PathBuf,

    /// Control loop tempo.
    #[arg(long, default_value_t = 30.0)]
    hz: f64,

    /// Use the in-memory I/O device instead of GPIO hardware.
    #[arg(long)]
    mock_io: bool,

    /// Use the in-memory DMX sink instead of real output ports.
    #[arg(long)]
    mock_dmx: bool,

    /// If true, poll for artnet interfaces as possible DMX ports.
    #[arg(long)]
    artnet: bool,

    /// GPIO input pin map, "channel:pin,channel:pin".
    #[arg(long)]
    gpio_input_pins: Option<String>,

    /// GPIO PWM pin map, "channel:pin,channel:pin".
    #[arg(long)]
    gpio_pwm_pins: Option<String>,
}

#[derive(Args)]
struct CheckArgs {
    /// Path to the config file.
    config_file: PathBuf,
}

fn main() {
    let args = Cli::parse();

    let log_level = if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(err) = SimpleLogger::init(log_level, LogConfig::default()) {
        eprintln!("failed to initialize logging: {err}");
    }

    let code = match args.command {
        Command::Run(args) => run(args),
        Command::Check(args) => check(args),
    };
    std::process::exit(code);
}

fn check(args: CheckArgs) -> i32 {
    match Snapshot::from_file(&args.config_file) {
        Ok(_) => {
            println!("Config is OK.");
            0
        }
        Err(err) => {
            eprintln!("Config is invalid: {err:#}");
            1
        }
    }
}

fn run(args: RunArgs) -> i32 {
    // A bad config at startup is fatal; reloads later keep the old one.
    let snapshot = match Snapshot::from_file(&args.config_file) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!("startup config rejected: {err:#}");
            return 1;
        }
    };

    let io = build_io(&args);
    let dmx = match build_dmx(&args) {
        Ok(dmx) => dmx,
        Err(err) => {
            error!("DMX driver unrecoverable: {err:#}");
            return 2;
        }
    };

    let daemon = match Daemon::new(
        snapshot,
        args.config_file.clone(),
        HardwareManager::new(io, dmx),
        Box::new(LoggingPersistence),
        Box::new(LoggingConfigSink),
    ) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!("daemon initialization failed: {err:#}");
            return 1;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    }) {
        warn!("signal handler not installed: {err}");
    }

    daemon.run(args.hz, &shutdown);
    info!("daemon stopped");
    0
}

fn build_io(args: &RunArgs) -> Io {
    if args.mock_io {
        info!("Using mock I/O device.");
        return Io::Mock(MockIo::new());
    }
    let input_pins = parse_pin_mapping(
        args.gpio_input_pins
            .as_deref()
            .unwrap_or(DEFAULT_GPIO_INPUT_PINS),
    );
    let pwm_pins = parse_pin_mapping(
        args.gpio_pwm_pins
            .as_deref()
            .unwrap_or(DEFAULT_GPIO_PWM_PINS),
    );
    Io::Gpio(GpioIo::new(input_pins, pwm_pins))
}

fn build_dmx(args: &RunArgs) -> Result<Dmx> {
    if args.mock_dmx {
        info!("Using mock DMX sink.");
        return Ok(Dmx::Mock(MockDmx::new()));
    }
    if args.artnet {
        info!("Searching for artnet ports...");
    }
    let available = available_ports(args.artnet.then_some(ARTNET_POLL_TIMEOUT))
        .context("enumerating DMX ports")?;
    let mut ports = Vec::new();
    for (universe, port) in (0..UNIVERSE_COUNT).zip(
        available
            .into_iter()
            .chain(std::iter::repeat_with(|| {
                Box::new(OfflineDmxPort) as Box<dyn DmxPort>
            })),
    ) {
        info!("Assigning universe {universe} to port {port}.");
        ports.push(port);
    }
    Ok(Dmx::Port(PortDmx::new(ports)))
}
