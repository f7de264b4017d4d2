//! rpi-usb device monitor
//!
//! Lists USB and USB-serial devices on a Raspberry Pi (or any Linux host) and
//! reports devices being attached and detached.

use anyhow::{Context, Result};
use clap::Parser;
use common::{DeviceChangeEvent, DeviceRecord, SystemCommandRunner, setup_logging};
use monitor::config::expand_path;
use monitor::{
    DeviceMonitor, DeviceSource, MonitorConfig, SerialSource, SourceKind, UsbSource, lsusb, udevadm,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rpi-usb-monitor")]
#[command(
    author,
    version,
    about = "rpi-usb monitor - Watch USB devices being attached and detached"
)]
#[command(long_about = "
Lists USB and USB-serial devices using lsusb and udevadm and reports every
device that is attached or detached while it runs.

EXAMPLES:
    # Watch USB-serial adapters (/dev/ttyUSB*, /dev/ttyACM*)
    rpi-usb-monitor

    # Watch every USB device reported by lsusb
    rpi-usb-monitor --source usb

    # Emit events as JSON lines
    rpi-usb-monitor --json

    # List USB devices and exit
    rpi-usb-monitor --list-devices

    # List USB-serial devices and exit
    rpi-usb-monitor --list-serial

    # Run with debug logging
    rpi-usb-monitor --log-level debug

CONFIGURATION:
    The monitor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/rpi-usb/monitor.toml
    3. /etc/rpi-usb/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices (lsusb) and exit
    #[arg(long)]
    list_devices: bool,

    /// List USB-serial devices (udevadm) and exit
    #[arg(long, conflicts_with = "list_devices")]
    list_serial: bool,

    /// Devices to monitor (overrides the config file)
    #[arg(short, long, value_enum)]
    source: Option<SourceKind>,

    /// Print devices and events as JSON lines
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = MonitorConfig::default();
        let path = args
            .config
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(MonitorConfig::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        MonitorConfig::load(Some(expand_path(path))).context("Failed to load configuration")?
    } else {
        MonitorConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rpi-usb monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    common::ensure_linux().context("Unsupported platform")?;

    let runner = Arc::new(SystemCommandRunner);

    if args.list_devices {
        return list_devices_mode(runner.as_ref(), &config, args.json).await;
    }

    if args.list_serial {
        return list_serial_mode(runner.as_ref(), &config, args.json).await;
    }

    let settings = config.monitor_settings();
    match args.source.unwrap_or(config.monitor.source) {
        SourceKind::Serial => {
            let source = SerialSource::new(runner.clone(), config.serial.device_globs.clone());
            let monitor = DeviceMonitor::new(source, runner, settings)?;
            run_monitor(monitor, args.json).await
        }
        SourceKind::Usb => {
            let filters = config.usb.parsed_filters()?;
            let source = UsbSource::new(runner.clone(), config.usb.verbose).with_filters(filters);
            let monitor = DeviceMonitor::new(source, runner, settings)?;
            run_monitor(monitor, args.json).await
        }
    }
}

/// List USB devices and exit
async fn list_devices_mode(
    runner: &SystemCommandRunner,
    config: &MonitorConfig,
    json: bool,
) -> Result<()> {
    info!("Listing USB devices...");

    let filters = config.usb.parsed_filters()?;
    let mut devices = lsusb::list_usb_devices(runner, config.usb.verbose)
        .await
        .context("Failed to list USB devices")?;
    devices.retain(|d| monitor::filter::is_allowed(&filters, d.vendor_id, d.product_id));

    if json {
        return print_json_lines(&devices);
    }

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device.summary());
            if let Some(manufacturer) = &device.manufacturer {
                println!("      Manufacturer: {}", manufacturer);
            }
            if let Some(serial) = &device.serial_number {
                println!("      Serial: {}", serial);
            }
        }
    }

    Ok(())
}

/// List USB-serial devices and exit
async fn list_serial_mode(
    runner: &SystemCommandRunner,
    config: &MonitorConfig,
    json: bool,
) -> Result<()> {
    info!("Listing USB-serial devices...");

    let devices = udevadm::list_serial_devices(runner, config.serial.device_globs.as_slice()).await;

    if json {
        return print_json_lines(&devices);
    }

    if devices.is_empty() {
        println!("No USB-serial devices found.");
    } else {
        println!("Found {} USB-serial device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device.summary());
            println!("      Path: {}", device.devpath);
        }
    }

    Ok(())
}

fn print_json_lines<T: Serialize>(items: &[T]) -> Result<()> {
    for item in items {
        println!("{}", serde_json::to_string(item).context("Failed to serialize device")?);
    }
    Ok(())
}

fn format_event<D: DeviceRecord>(event: &DeviceChangeEvent<D>, json: bool) -> String {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize event: {}", e);
                format!("{} {}", event.kind, event.device.summary())
            }
        }
    } else {
        format!("{} {}", event.kind, event.device.summary())
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Error waiting for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

/// Print events until a shutdown signal, then stop the monitor
async fn run_monitor<S: DeviceSource>(
    monitor: DeviceMonitor<S, SystemCommandRunner>,
    json: bool,
) -> Result<()> {
    monitor
        .on_device_change(move |event| println!("{}", format_event(event, json)))
        .await
        .context("Failed to start monitoring")?;

    info!("Press Ctrl+C to stop");
    wait_for_shutdown_signal().await;

    monitor.shutdown().await.context("Failed to stop monitoring")?;
    info!("Monitor stopped");
    Ok(())
}
