//! Test utilities for rpi-usb
//!
//! Provides canned tool output, mock device records and a scripted
//! [`CommandRunner`] so parsers and the monitor can be tested without
//! hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_usb_device;
//!
//! # fn main() {
//! let device = create_mock_usb_device(1, 4, 0x0bda, 0x8179);
//! assert_eq!(device.vendor_id, 0x0bda);
//! # }
//! ```

use crate::command::{CommandOutput, CommandRunner, LineStream, ProcessLine};
use crate::usb_types::{SerialDevice, UdevProperty, UsbDevice};
use crate::{Error, Result};
use async_channel::Sender;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain `lsusb` output from a Raspberry Pi 3
pub const LSUSB_OUTPUT: &str = "\
Bus 001 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub
Bus 002 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub
Bus 001 Device 002: ID 0424:9514 Standard Microsystems Corp.
Bus 001 Device 003: ID 0424:ec00 Standard Microsystems Corp.
Bus 001 Device 004: ID 0bda:8179 Realtek Semiconductor Corp. RTL8188EUS 802.11n Wireless Network Adapter
";

/// Abridged `lsusb -v` output for two devices
pub const LSUSB_VERBOSE_OUTPUT: &str = "\

Bus 001 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub
Couldn't open device, some information will be missing
Device Descriptor:
  bLength                18
  bDescriptorType         1
  bcdUSB               2.00
  bDeviceClass            9 Hub
  idVendor           0x1d6b Linux Foundation
  idProduct          0x0002 2.0 root hub
  bcdDevice            6.01
  iManufacturer           3 Linux 6.1.21-v8+ dwc_otg_hcd
  iProduct                2 DWC OTG Controller
  iSerial                 1 3f980000.usb
  bNumConfigurations      1
  Configuration Descriptor:
    bmAttributes         0xe0
      Self Powered
      Remote Wakeup
    MaxPower                0mA

Bus 001 Device 005: ID 0403:6001 Future Technology Devices International, Ltd FT232 Serial (UART) IC
Device Descriptor:
  bLength                18
  idVendor           0x0403 Future Technology Devices International, Ltd
  idProduct          0x6001 FT232 Serial (UART) IC
  iManufacturer           1 FTDI
  iProduct                2 FT232R USB UART
  iSerial                 0
  Configuration Descriptor:
    bmAttributes         0xa0
      (Bus Powered)
      Remote Wakeup
    MaxPower               90mA
";

/// Create a mock [`UsbDevice`]
pub fn create_mock_usb_device(
    bus: u16,
    address: u16,
    vendor_id: u16,
    product_id: u16,
) -> UsbDevice {
    let mut device = UsbDevice::new(bus, address, vendor_id, product_id);
    device.description = Some(format!("Test Device {:04x}:{:04x}", vendor_id, product_id));
    device
}

/// Render devices the way plain `lsusb` prints them
pub fn lsusb_output_for(devices: &[UsbDevice]) -> String {
    devices
        .iter()
        .map(|d| {
            format!(
                "Bus {:03} Device {:03}: ID {:04x}:{:04x} {}\n",
                d.bus_number,
                d.device_address,
                d.vendor_id,
                d.product_id,
                d.description.as_deref().unwrap_or("")
            )
        })
        .collect()
}

/// Create a mock FTDI-style [`SerialDevice`]
pub fn create_mock_serial_device(devname: &str, devpath: &str) -> SerialDevice {
    let mut device = SerialDevice::default();
    device.set(UdevProperty::DevName, devname);
    device.set(UdevProperty::DevPath, devpath);
    device.set(UdevProperty::Subsystem, "tty");
    device.set(UdevProperty::IdBus, "usb");
    device.set(UdevProperty::IdVendor, "FTDI");
    device.set(UdevProperty::IdVendorId, "0403");
    device.set(UdevProperty::IdModel, "FT232R_USB_UART");
    device.set(UdevProperty::IdModelId, "6001");
    device.set(UdevProperty::IdSerial, "FTDI_FT232R_USB_UART_A50285BI");
    device.set(UdevProperty::IdSerialShort, "A50285BI");
    device.set(UdevProperty::IdUsbDriver, "ftdi_sio");
    device.set(UdevProperty::IdUsbInterfaceNum, "00");
    device
}

/// Render `udevadm info -q all -n <devname>` output for a serial adapter
pub fn udevadm_info_output(devname: &str, devpath: &str) -> String {
    let name = devname.trim_start_matches("/dev/");
    format!(
        "P: {devpath}\n\
         N: {name}\n\
         L: 0\n\
         S: serial/by-id/usb-FTDI_FT232R_USB_UART_A50285BI-if00-port0\n\
         E: DEVPATH={devpath}\n\
         E: DEVNAME={devname}\n\
         E: MAJOR=188\n\
         E: MINOR=0\n\
         E: SUBSYSTEM=tty\n\
         E: USEC_INITIALIZED=5871539\n\
         E: ID_BUS=usb\n\
         E: ID_VENDOR=FTDI\n\
         E: ID_VENDOR_ID=0403\n\
         E: ID_MODEL=FT232R_USB_UART\n\
         E: ID_MODEL_ID=6001\n\
         E: ID_SERIAL=FTDI_FT232R_USB_UART_A50285BI\n\
         E: ID_SERIAL_SHORT=A50285BI\n\
         E: ID_USB_DRIVER=ftdi_sio\n\
         E: ID_USB_INTERFACE_NUM=00\n\
         E: DEVLINKS=/dev/serial/by-id/usb-FTDI_FT232R_USB_UART_A50285BI-if00-port0\n\
         E: TAGS=:systemd:\n\
         \n"
    )
}

/// A `udevadm monitor --udev` event line
pub fn udev_monitor_line(action: &str, devpath: &str, subsystem: &str) -> String {
    format!("UDEV  [12345.678901] {:<8} {} ({})", action, devpath, subsystem)
}

/// Run a future with a timeout
///
/// Wraps tokio::time::timeout with a more convenient API for tests.
pub async fn with_timeout<T, F>(
    duration: Duration,
    future: F,
) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

enum Scripted {
    Output(CommandOutput),
    SpawnError(String),
}

struct ScriptedStream {
    line_tx: Sender<ProcessLine>,
    kill_rx: oneshot::Receiver<()>,
    killed: bool,
}

/// [`CommandRunner`] that answers from a script instead of spawning processes
///
/// One-shot commands are matched on their full command line
/// (`"program arg1 arg2"`). Unscripted commands fail as if the program
/// could not be spawned. Every `spawn_lines` call creates a stream the test
/// feeds with [`ScriptedRunner::send_line`].
#[derive(Default)]
pub struct ScriptedRunner {
    outputs: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
    streams: Mutex<Vec<ScriptedStream>>,
    spawn_failures: Mutex<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with a successful run printing `stdout`
    pub fn set_stdout(&self, command: &str, stdout: impl Into<String>) {
        self.set_output(command, CommandOutput::success(stdout));
    }

    /// Answer `command` with an arbitrary output
    pub fn set_output(&self, command: &str, output: CommandOutput) {
        lock(&self.outputs).insert(command.to_string(), Scripted::Output(output));
    }

    /// Make `command` fail to spawn
    pub fn set_spawn_error(&self, command: &str, message: &str) {
        lock(&self.outputs).insert(command.to_string(), Scripted::SpawnError(message.to_string()));
    }

    /// Forget the script for `command`
    pub fn remove(&self, command: &str) {
        lock(&self.outputs).remove(command);
    }

    /// Make the next `count` calls to `spawn_lines` fail
    pub fn fail_next_spawns(&self, count: usize) {
        *lock(&self.spawn_failures) = count;
    }

    /// Command lines seen so far, in order
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of times `command` was run
    pub fn call_count(&self, command: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == command).count()
    }

    /// Number of streams spawned so far
    pub fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Push a stdout line into stream `index`
    pub fn send_line(&self, index: usize, line: impl Into<String>) -> bool {
        self.send(index, ProcessLine::Stdout(line.into()))
    }

    /// Push a stderr line into stream `index`
    pub fn send_stderr(&self, index: usize, line: impl Into<String>) -> bool {
        self.send(index, ProcessLine::Stderr(line.into()))
    }

    /// End stream `index` as if the process exited with `code`
    pub fn finish_stream(&self, index: usize, code: Option<i32>) -> bool {
        let sent = self.send(index, ProcessLine::Exited(code));
        if let Some(stream) = lock(&self.streams).get(index) {
            stream.line_tx.close();
        }
        sent
    }

    /// Whether the consumer of stream `index` killed or dropped it
    pub fn stream_killed(&self, index: usize) -> bool {
        let mut streams = lock(&self.streams);
        let Some(stream) = streams.get_mut(index) else {
            return false;
        };
        if !stream.killed {
            stream.killed = !matches!(
                stream.kill_rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            );
        }
        stream.killed
    }

    fn send(&self, index: usize, line: ProcessLine) -> bool {
        match lock(&self.streams).get(index) {
            Some(stream) => stream.line_tx.try_send(line).is_ok(),
            None => false,
        }
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        lock(&self.calls).push(line.clone());

        match lock(&self.outputs).get(&line) {
            Some(Scripted::Output(output)) => output.clone().check(program),
            Some(Scripted::SpawnError(message)) => Err(Error::command(program, message.clone())),
            None => Err(Error::command(program, "No such file or directory (os error 2)")),
        }
    }

    async fn spawn_lines(&self, program: &str, args: &[&str]) -> Result<LineStream> {
        let line = command_line(program, args);
        lock(&self.calls).push(line);

        {
            let mut failures = lock(&self.spawn_failures);
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::command(program, "No such file or directory (os error 2)"));
            }
        }

        let (line_tx, line_rx) = async_channel::unbounded();
        let (kill_tx, kill_rx) = oneshot::channel();
        lock(&self.streams).push(ScriptedStream {
            line_tx,
            kill_rx,
            killed: false,
        });

        Ok(LineStream::new(line_rx, kill_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_outputs() {
        let runner = ScriptedRunner::new();
        runner.set_stdout("lsusb", LSUSB_OUTPUT);

        let output = runner.run("lsusb", &[]).await.unwrap();
        assert_eq!(output.stdout, LSUSB_OUTPUT);

        assert!(runner.run("lsusb", &["-v"]).await.is_err());
        assert_eq!(runner.calls(), vec!["lsusb", "lsusb -v"]);
        assert_eq!(runner.call_count("lsusb"), 1);
    }

    #[tokio::test]
    async fn test_scripted_runner_non_zero_exit() {
        let runner = ScriptedRunner::new();
        runner.set_output(
            "lsusb",
            CommandOutput {
                status_code: Some(1),
                stdout: String::new(),
                stderr: "lsusb command failed".to_string(),
            },
        );

        let err = runner.run("lsusb", &[]).await.unwrap_err();
        assert!(err.to_string().contains("lsusb command failed"));
    }

    #[tokio::test]
    async fn test_scripted_streams() {
        let runner = ScriptedRunner::new();
        let stream = runner.spawn_lines("udevadm", &["monitor"]).await.unwrap();
        assert_eq!(runner.stream_count(), 1);

        assert!(runner.send_line(0, "hello"));
        assert!(runner.finish_stream(0, Some(1)));
        assert_eq!(stream.next().await, Some(ProcessLine::Stdout("hello".to_string())));
        assert_eq!(stream.next().await, Some(ProcessLine::Exited(Some(1))));
        assert_eq!(stream.next().await, None);

        assert!(!runner.stream_killed(0));
        drop(stream);
        assert!(runner.stream_killed(0));
    }

    #[tokio::test]
    async fn test_scripted_spawn_failures() {
        let runner = ScriptedRunner::new();
        runner.fail_next_spawns(1);
        assert!(runner.spawn_lines("udevadm", &[]).await.is_err());
        assert!(runner.spawn_lines("udevadm", &[]).await.is_ok());
        assert_eq!(runner.stream_count(), 1);
    }

    #[test]
    fn test_lsusb_output_for() {
        let devices = vec![create_mock_usb_device(1, 2, 0x0403, 0x6001)];
        assert_eq!(
            lsusb_output_for(&devices),
            "Bus 001 Device 002: ID 0403:6001 Test Device 0403:6001\n"
        );
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
        assert!(result.is_err());
    }
}
