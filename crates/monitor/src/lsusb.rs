//! `lsusb` output parsing
//!
//! Handles both the one-line-per-device format of plain `lsusb` and the
//! descriptor dump of `lsusb -v`. Only the header line and the string
//! descriptor indices (`iManufacturer`, `iProduct`, `iSerial`) are used.

use common::{CommandRunner, Error, Result, UsbDevice};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

fn header_regex() -> &'static Regex {
    static HEADER_RE: OnceLock<Regex> = OnceLock::new();
    HEADER_RE.get_or_init(|| {
        Regex::new(r"^Bus (\d+) Device (\d+): ID ([0-9A-Fa-f]{4}):([0-9A-Fa-f]{4})(?:\s+(.*))?$")
            .expect("valid lsusb header regex")
    })
}

fn string_descriptor_regex() -> &'static Regex {
    static STRING_RE: OnceLock<Regex> = OnceLock::new();
    STRING_RE.get_or_init(|| {
        Regex::new(r"^\s+(iManufacturer|iProduct|iSerial)\s+\d+\s*(.*)$")
            .expect("valid lsusb string descriptor regex")
    })
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Parse one header line (`Bus 001 Device 004: ID 0bda:8179 ...`)
pub fn parse_header(line: &str) -> Option<UsbDevice> {
    let caps = header_regex().captures(line.trim_end())?;

    let bus_number = caps[1].parse().ok()?;
    let device_address = caps[2].parse().ok()?;
    let vendor_id = u16::from_str_radix(&caps[3], 16).ok()?;
    let product_id = u16::from_str_radix(&caps[4], 16).ok()?;

    let mut device = UsbDevice::new(bus_number, device_address, vendor_id, product_id);
    device.description = caps.get(5).and_then(|m| non_empty(m.as_str()));
    Some(device)
}

/// Parse `lsusb` or `lsusb -v` output into devices, in output order
pub fn parse_lsusb_output(output: &str) -> Vec<UsbDevice> {
    let mut devices = Vec::new();
    let mut current: Option<UsbDevice> = None;

    for line in output.lines() {
        if let Some(device) = parse_header(line) {
            if let Some(previous) = current.replace(device) {
                devices.push(previous);
            }
            continue;
        }

        let Some(device) = current.as_mut() else {
            continue;
        };

        if let Some(caps) = string_descriptor_regex().captures(line.trim_end()) {
            let value = non_empty(&caps[2]);
            match &caps[1] {
                "iManufacturer" => device.manufacturer = value,
                "iProduct" => device.product = value,
                "iSerial" => device.serial_number = value,
                _ => {}
            }
        }
    }

    if let Some(device) = current {
        devices.push(device);
    }

    devices
}

/// List USB devices by running `lsusb` (`lsusb -v` when `verbose`)
pub async fn list_usb_devices<R: CommandRunner>(
    runner: &R,
    verbose: bool,
) -> Result<Vec<UsbDevice>> {
    let args: &[&str] = if verbose { &["-v"] } else { &[] };

    let output = runner.run("lsusb", args).await.map_err(|e| match e {
        Error::Command { program, message } => Error::Command {
            program,
            message: format!("Failed to list USB devices: {}", message),
        },
        other => other,
    })?;

    // Unprivileged `lsusb -v` warns about every device it cannot open
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        warn!("lsusb reported: {}", stderr.lines().next().unwrap_or(stderr));
    }

    let devices = parse_lsusb_output(&output.stdout);
    debug!("lsusb listed {} devices", devices.len());
    Ok(devices)
}
