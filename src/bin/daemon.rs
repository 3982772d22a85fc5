// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! openfand: system service that drives the OpenFan controller from
//! temperature curves and streams fan state to clients over a Unix domain
//! socket.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use openfan_utility::config::{self, Config, FanSettings};
use openfan_utility::controller::{ControlLoop, FanDevice};
use openfan_utility::curve::CurveShaper;
use openfan_utility::hwmon::{Collector, Temperature, TemperatureId};
use openfan_utility::monitor::{self, MonitorSocket};
use openfan_utility::openfan::{self, DummyController};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "openfand", about = "OpenFan fan control daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the socket path.
    #[arg(short, long)]
    socket: Option<String>,

    /// Use an in-memory fan controller instead of the USB device.
    #[arg(long)]
    dummy: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every temperature sensor with its current reading.
    ShowSensors,

    /// Print the PWM each fan curve yields across the temperature range.
    ShowCurves {
        /// Temperature step between rows, in °C.
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
        step: u32,
    },
}

fn init_logging(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = config::resolve_config_path(Some(&cli.config));
    config::load_config(&path).with_context(|| format!("Could not load {}", path.display()))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::ShowSensors) => {
            init_logging("warn");
            show_sensors()
        }
        Some(Command::ShowCurves { step }) => {
            let cfg = load_config(&cli)?;
            init_logging("warn");
            show_curves(&cfg, *step)
        }
        None => run(&cli).await,
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let cfg = load_config(cli)?;
    init_logging(if cfg.debug { "debug" } else { "info" });
    log::info!("Loaded config from {}", cli.config);

    let fans = cfg.fans()?;
    let socket_path = cli.socket.clone().unwrap_or_else(|| cfg.socket.clone());

    // Fan controller
    let device: Arc<dyn FanDevice> = if cli.dummy {
        log::warn!("Using the dummy fan controller");
        Arc::new(DummyController::new())
    } else {
        Arc::new(openfan::Controller::open_auto().context("Could not open the OpenFan controller")?)
    };
    log_device(device.as_ref())?;

    // Temperature sensors
    let collector = collect_sensors(&fans)?;
    let catalog = collector.temperatures().temperatures;
    let shaper = CurveShaper::new(&fans, &catalog)?;

    // Control loop and monitor socket
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    let socket = MonitorSocket::bind(Path::new(&socket_path))
        .with_context(|| format!("Could not bind {socket_path}"))?;
    let handle = ControlLoop::new(
        fans,
        device,
        Arc::new(collector),
        shaper,
        cfg.poll_interval(),
    )
    .launch(token.clone(), &tracker);
    tracker.spawn(monitor::serve(socket, handle, token.clone(), tracker.clone()));

    shutdown_signal().await?;
    log::info!("Received shutdown signal");

    token.cancel();
    tracker.close();
    tracker.wait().await;

    log::info!("Daemon stopped");
    Ok(())
}

fn log_device(device: &dyn FanDevice) -> anyhow::Result<()> {
    let hw = device
        .hardware_info()
        .context("Could not read hardware info")?;
    let fw = device
        .firmware_info()
        .context("Could not read firmware info")?;

    log::info!("Port: {}", device.port());
    log::info!(
        "Hardware: revision {} - MCU {} - USB {} - {} channel(s), {}, {}",
        hw.revision,
        hw.mcu,
        hw.usb,
        hw.fan_channels_total,
        hw.fan_channels_arch,
        hw.fan_channels_driver
    );
    log::info!(
        "Firmware: revision {} - protocol {}",
        fw.revision,
        fw.protocol_version
    );
    Ok(())
}

/// Discover sensors, then keep only those the curves refer to. A configured
/// sensor that does not exist is fatal.
fn collect_sensors(fans: &[FanSettings]) -> anyhow::Result<Collector> {
    let (mut collector, errors) =
        Collector::discover().context("Could not discover temperature sensors")?;
    for e in &errors {
        log::warn!("Skipping sensor: {e}");
    }

    let readings = collector.temperatures();
    for e in &readings.errors {
        log::warn!("Could not read sensor: {e}");
    }

    let wanted: BTreeSet<&str> = fans.iter().flat_map(FanSettings::sensor_names).collect();
    for name in &wanted {
        if !readings.temperatures.iter().any(|t| t.name == *name) {
            bail!("Temperature sensor {name:?} not found");
        }
    }

    let unused: Vec<&str> = readings
        .temperatures
        .iter()
        .map(|t| t.name.as_str())
        .filter(|name| !wanted.contains(name))
        .collect();
    collector.drop_sensors(&unused);

    log::info!(
        "Watching {} of {} temperature sensor(s)",
        collector.len(),
        readings.temperatures.len()
    );
    Ok(collector)
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

fn show_sensors() -> anyhow::Result<()> {
    let (collector, errors) =
        Collector::discover().context("Could not discover temperature sensors")?;
    for e in &errors {
        log::warn!("Skipping sensor: {e}");
    }

    let mut temps = collector.temperatures().temperatures;
    temps.sort_by_key(|t| t.name.to_lowercase());
    for t in &temps {
        println!("{:3.0}°C   {:?}", t.temperature, t.name);
    }
    Ok(())
}

fn show_curves(cfg: &Config, step: u32) -> anyhow::Result<()> {
    let fans = cfg.fans()?;

    // Curves only need sensor names, not live sensors.
    let names: BTreeSet<&str> = fans.iter().flat_map(FanSettings::sensor_names).collect();
    let catalog: Vec<Temperature> = names
        .iter()
        .enumerate()
        .map(|(i, name)| Temperature {
            id: TemperatureId(i as u16),
            name: name.to_string(),
            ..Default::default()
        })
        .collect();
    let shaper = CurveShaper::new(&fans, &catalog)?;

    for fan in &fans {
        let sensors: Vec<&Temperature> = {
            let used: BTreeSet<&str> = fan.sensor_names().collect();
            catalog
                .iter()
                .filter(|t| used.contains(t.name.as_str()))
                .collect()
        };
        let max_temperature = fan
            .curve_points
            .iter()
            .flat_map(|p| p.thresholds.values().copied())
            .max()
            .unwrap_or(0)
            .max(100);

        println!("{}({})", fan.id, fan.label);
        print!("{:>6}", "°C");
        for s in &sensors {
            print!("  {:>w$}", s.name, w = s.name.len().max(4));
        }
        println!();

        for t in (0..=max_temperature).step_by(step as usize) {
            print!("{t:>6}");
            for s in &sensors {
                let pwm = shaper.pwm_for(s.id, fan.id, t as f64).unwrap_or(0);
                print!("  {:>w$}", format!("{pwm}%"), w = s.name.len().max(4));
            }
            println!();
        }
        println!();
    }
    Ok(())
}
