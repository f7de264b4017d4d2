//! Common utilities for rpi-usb
//!
//! This crate provides the pieces shared by the device monitor and its tests:
//! device record types, the subprocess runner, error handling, logging and
//! the Linux platform guard.

pub mod command;
pub mod error;
pub mod logging;
pub mod platform;
pub mod test_utils;
pub mod usb_types;

pub use command::{CommandOutput, CommandRunner, LineStream, ProcessLine, SystemCommandRunner};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use platform::{ensure_linux, is_linux};
pub use usb_types::{
    ChangeKind, DeviceChangeEvent, DeviceRecord, SerialDevice, UdevProperty, UsbDevice,
};
