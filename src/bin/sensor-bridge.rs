//! Polls the configured sensors and keeps the latest readings available
//! until interrupted.
//!
//! ```bash
//! sensor-bridge --sonde-port /dev/ttyUSB0 --o2-port /dev/ttyUSB1 \
//!     --snapshot-file sensor_data.json
//! ```

use clap::Parser;
use sensor_bridge::{
    config::{Config, OXYGEN_TAG, SONDE_TAG},
    sink::{run_sinks, JsonFileSink, LogRecorder, RecordingSink, Sink},
    supervisor::AcquisitionSupervisor,
    Result,
};
use std::{path::PathBuf, process::ExitCode, time::Duration};

#[derive(Parser, Debug)]
#[command(name = "sensor-bridge")]
#[command(about = "Acquire serial and Modbus RTU sensor readings", long_about = None)]
struct Cli {
    /// TOML configuration file (default: built-in field configuration)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the water-quality sonde
    #[arg(long)]
    sonde_port: Option<String>,

    /// Serial port of the dissolved-oxygen transducer
    #[arg(long)]
    o2_port: Option<String>,

    /// Port of any configured sensor, as TAG=PORT
    #[arg(long = "port", value_parser = parse_port_override)]
    ports: Vec<(String, String)>,

    /// Write the latest snapshot to this JSON file
    #[arg(long)]
    snapshot_file: Option<PathBuf>,

    /// How often sinks receive a snapshot, e.g. "5s"
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    publish_interval: Option<Duration>,
}

fn parse_port_override(arg: &str) -> std::result::Result<(String, String), String> {
    match arg.split_once('=') {
        Some((tag, port)) if !tag.is_empty() && !port.is_empty() => {
            Ok((tag.to_owned(), port.to_owned()))
        }
        _ => Err(format!("expected TAG=PORT, got '{}'", arg)),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::field_default(),
    };
    if let Some(port) = &cli.sonde_port {
        config.override_port(SONDE_TAG, port.as_str())?;
    }
    if let Some(port) = &cli.o2_port {
        config.override_port(OXYGEN_TAG, port.as_str())?;
    }
    for (tag, port) in &cli.ports {
        config.override_port(tag, port.as_str())?;
    }
    if let Some(path) = &cli.snapshot_file {
        config.publish.snapshot_file = Some(path.display().to_string());
    }
    if let Some(interval) = cli.publish_interval {
        config.publish.interval = interval;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut supervisor = AcquisitionSupervisor::new();
    for sensor in &config.sensors {
        if sensor.port.is_none() {
            log::info!("No port configured for {}, not instantiated", sensor.tag);
            continue;
        }
        if let Err(err) = supervisor.register(sensor) {
            log::error!("{}", err);
            supervisor.shutdown().await;
            return ExitCode::FAILURE;
        }
    }
    if supervisor.readers().is_empty() {
        log::warn!("No sensor has a port, nothing to acquire");
    }

    let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(RecordingSink::new(LogRecorder))];
    if let Some(path) = &config.publish.snapshot_file {
        log::info!("Writing snapshots to {}", path);
        sinks.push(Box::new(JsonFileSink::new(path)));
    }
    let pump = tokio::spawn(run_sinks(
        supervisor.snapshot_source(),
        sinks,
        config.publish.interval,
        supervisor.tripwire(),
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Failed to wait for Ctrl-C: {}", err);
    }
    log::info!("Interrupted, shutting down");
    supervisor.shutdown().await;
    if let Err(err) = pump.await {
        log::error!("Sink task terminated abnormally: {}", err);
    }
    ExitCode::SUCCESS
}
