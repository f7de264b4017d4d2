//! `udevadm` integration
//!
//! Parses `udevadm info -q all` property dumps into [`SerialDevice`]s and
//! `udevadm monitor --udev` event lines into [`UdevEvent`]s.

use common::{CommandRunner, Result, SerialDevice, UdevProperty};
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Device nodes created by the USB-serial drivers
pub const DEFAULT_SERIAL_GLOBS: [&str; 2] = ["/dev/ttyUSB*", "/dev/ttyACM*"];

/// Subsystems watched by `udevadm monitor`
pub const DEFAULT_SUBSYSTEMS: [&str; 2] = ["tty", "usb"];

fn property_regex() -> &'static Regex {
    static PROPERTY_RE: OnceLock<Regex> = OnceLock::new();
    PROPERTY_RE
        .get_or_init(|| Regex::new(r"^E: (\w+)=([^\n\r]+)").expect("valid udev property regex"))
}

fn event_regex() -> &'static Regex {
    static EVENT_RE: OnceLock<Regex> = OnceLock::new();
    EVENT_RE.get_or_init(|| {
        Regex::new(r"^UDEV\s+\[\d+\.\d+\]\s+(add|remove)\s+(\S+)(?:\s+\(([^)]+)\))?")
            .expect("valid udev event regex")
    })
}

/// Parse `udevadm info -q all` output
///
/// Returns `None` when the dump carries no `DEVNAME`.
pub fn parse_udevadm_info(output: &str) -> Option<SerialDevice> {
    let mut device = SerialDevice::default();
    let mut has_devname = false;

    for line in output.lines() {
        let Some(caps) = property_regex().captures(line) else {
            continue;
        };
        let Some(property) = UdevProperty::from_key(&caps[1]) else {
            continue;
        };

        has_devname |= property == UdevProperty::DevName;
        device.set(property, &caps[2]);
    }

    has_devname.then_some(device)
}

/// Expand device node globs, skipping duplicates and unreadable entries
pub fn expand_device_globs<S: AsRef<str>>(patterns: &[S]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();

    for pattern in patterns {
        let pattern = pattern.as_ref();
        let entries = match glob::glob(pattern) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Invalid device glob '{}': {}", pattern, e);
                continue;
            }
        };

        for entry in entries {
            match entry {
                Ok(path) => {
                    if seen.insert(path.clone()) {
                        paths.push(path);
                    }
                }
                Err(e) => debug!("Skipping unreadable path: {}", e),
            }
        }
    }

    paths
}

/// Query udev for one device node
pub async fn query_device<R: CommandRunner>(
    runner: &R,
    devnode: &str,
) -> Result<Option<SerialDevice>> {
    let output = runner
        .run("udevadm", &["info", "-q", "all", "-n", devnode])
        .await?;
    Ok(parse_udevadm_info(&output.stdout))
}

/// List USB-serial devices matching `globs`
///
/// Devices whose udev query fails or lacks `DEVNAME` are skipped.
pub async fn list_serial_devices<R: CommandRunner, S: AsRef<str>>(
    runner: &R,
    globs: &[S],
) -> Vec<SerialDevice> {
    let mut devices = Vec::new();

    for path in expand_device_globs(globs) {
        let devnode = path.to_string_lossy();
        match query_device(runner, &devnode).await {
            Ok(Some(device)) => devices.push(device),
            Ok(None) => debug!("No DEVNAME reported for {}, skipping", devnode),
            Err(e) => debug!("Skipping unreadable device {}: {}", devnode, e),
        }
    }

    debug!("udevadm listed {} serial devices", devices.len());
    devices
}

/// Action reported by `udevadm monitor`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdevAction {
    Add,
    Remove,
}

/// One add/remove event from `udevadm monitor --udev`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdevEvent {
    pub action: UdevAction,
    pub devpath: String,
    pub subsystem: Option<String>,
}

/// Parse a `udevadm monitor` line
///
/// Only processed (`UDEV`) add/remove events are recognised.
pub fn parse_monitor_line(line: &str) -> Option<UdevEvent> {
    let caps = event_regex().captures(line.trim())?;

    let action = match &caps[1] {
        "add" => UdevAction::Add,
        "remove" => UdevAction::Remove,
        _ => return None,
    };

    Some(UdevEvent {
        action,
        devpath: caps[2].to_string(),
        subsystem: caps.get(3).map(|m| m.as_str().to_string()),
    })
}

/// Program and arguments for the long-running monitor process
///
/// With `line_buffered`, `udevadm` runs under `stdbuf -oL` so events are
/// flushed per line instead of per pipe buffer.
pub fn monitor_command<S: AsRef<str>>(
    subsystems: &[S],
    line_buffered: bool,
) -> (String, Vec<String>) {
    let mut args = Vec::new();
    if line_buffered {
        args.push("-oL".to_string());
        args.push("udevadm".to_string());
    }
    args.push("monitor".to_string());
    args.push("--udev".to_string());
    for subsystem in subsystems {
        args.push(format!("--subsystem-match={}", subsystem.as_ref()));
    }

    let program = if line_buffered { "stdbuf" } else { "udevadm" };
    (program.to_string(), args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{ScriptedRunner, udev_monitor_line, udevadm_info_output};

    const FTDI_DEVPATH: &str =
        "/devices/platform/soc/3f980000.usb/usb1/1-1/1-1.3/1-1.3:1.0/ttyUSB0/tty/ttyUSB0";

    #[test]
    fn test_parse_udevadm_info() {
        let output = udevadm_info_output("/dev/ttyUSB0", FTDI_DEVPATH);
        let device = parse_udevadm_info(&output).unwrap();

        assert_eq!(device.devname, "/dev/ttyUSB0");
        assert_eq!(device.devpath, FTDI_DEVPATH);
        assert_eq!(device.subsystem, "tty");
        assert_eq!(device.id_vendor_id, "0403");
        assert_eq!(device.id_model_id, "6001");
        assert_eq!(device.id_serial_short, "A50285BI");
        assert_eq!(device.id_usb_driver, "ftdi_sio");
        // Not present in the dump
        assert_eq!(device.id_path, "");
        assert_eq!(device.id_vendor_from_database, "");
    }

    #[test]
    fn test_parse_udevadm_info_requires_devname() {
        let output = "P: /devices/virtual/tty/tty0\nE: DEVPATH=/devices/virtual/tty/tty0\nE: SUBSYSTEM=tty\n";
        assert_eq!(parse_udevadm_info(output), None);
        assert_eq!(parse_udevadm_info(""), None);
    }

    #[test]
    fn test_parse_udevadm_info_ignores_other_lines() {
        let output = "S: DEVNAME=/dev/wrong\nE: DEVNAME=/dev/ttyACM0\nE: MAJOR=166\nE: ID_MODEL=Pico\r\n";
        let device = parse_udevadm_info(output).unwrap();
        assert_eq!(device.devname, "/dev/ttyACM0");
        assert_eq!(device.id_model, "Pico");
    }

    #[test]
    fn test_parse_monitor_line() {
        let event = parse_monitor_line(&udev_monitor_line("add", FTDI_DEVPATH, "tty")).unwrap();
        assert_eq!(event.action, UdevAction::Add);
        assert_eq!(event.devpath, FTDI_DEVPATH);
        assert_eq!(event.subsystem.as_deref(), Some("tty"));

        let line = "UDEV  [6094.314201] remove   /devices/platform/soc/usb1/1-1/1-1.3 (usb)";
        let event = parse_monitor_line(line).unwrap();
        assert_eq!(event.action, UdevAction::Remove);
        assert_eq!(event.devpath, "/devices/platform/soc/usb1/1-1/1-1.3");

        let event = parse_monitor_line("UDEV [1.000001] add /devices/x").unwrap();
        assert_eq!(event.subsystem, None);
    }

    #[test]
    fn test_parse_monitor_line_rejects_noise() {
        let noise = [
            "",
            "monitor will print the received events for:",
            "UDEV - the event which udev sends out after rule processing",
            "KERNEL[123.456] add      /devices/pci0000:00/usb1/1-1 (usb)",
            "UDEV  [123.456] bind     /devices/pci0000:00/usb1/1-1 (usb)",
            "UDEV  [123.456] change   /devices/pci0000:00/usb1/1-1 (usb)",
        ];
        for line in noise {
            assert!(parse_monitor_line(line).is_none(), "{:?}", line);
        }
    }

    #[test]
    fn test_monitor_command() {
        let (program, args) = monitor_command(&DEFAULT_SUBSYSTEMS, true);
        assert_eq!(program, "stdbuf");
        assert_eq!(
            args,
            vec![
                "-oL",
                "udevadm",
                "monitor",
                "--udev",
                "--subsystem-match=tty",
                "--subsystem-match=usb"
            ]
        );

        let (program, args) = monitor_command(&["usb"], false);
        assert_eq!(program, "udevadm");
        assert_eq!(args, vec!["monitor", "--udev", "--subsystem-match=usb"]);
    }

    #[test]
    fn test_expand_device_globs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB1", "ttyUSB0", "ttyACM0", "ttyS0"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let usb = format!("{}/ttyUSB*", dir.path().display());
        let acm = format!("{}/ttyACM*", dir.path().display());
        let paths = expand_device_globs(&[usb.clone(), acm, usb]);

        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ttyUSB0", "ttyUSB1", "ttyACM0"]);
    }

    #[tokio::test]
    async fn test_list_serial_devices_skips_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("ttyUSB0");
        let bad = dir.path().join("ttyUSB1");
        let empty = dir.path().join("ttyUSB2");
        for path in [&good, &bad, &empty] {
            std::fs::write(path, b"").unwrap();
        }

        let runner = ScriptedRunner::new();
        let good_name = good.display().to_string();
        runner.set_stdout(
            &format!("udevadm info -q all -n {}", good_name),
            udevadm_info_output(&good_name, FTDI_DEVPATH),
        );
        runner.set_spawn_error(&format!("udevadm info -q all -n {}", bad.display()), "device busy");
        runner.set_stdout(
            &format!("udevadm info -q all -n {}", empty.display()),
            "E: SUBSYSTEM=tty\n",
        );

        let pattern = format!("{}/ttyUSB*", dir.path().display());
        let devices = list_serial_devices(&runner, &[pattern]).await;

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].devname, good_name);
        assert_eq!(runner.calls().len(), 3);
    }
}
