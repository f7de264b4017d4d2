//! USB device monitor for Raspberry Pi
//!
//! Lists USB and USB-serial devices through the system tools (`lsusb`,
//! `udevadm`) and reports devices being attached and detached while
//! `udevadm monitor` is running.

pub mod config;
pub mod filter;
pub mod lsusb;
pub mod monitor;
pub mod source;
pub mod tracker;
pub mod udevadm;

pub use config::{MonitorConfig, SourceKind};
pub use filter::UsbFilter;
pub use monitor::{CallbackId, DeviceChangeCallback, DeviceMonitor, MonitorSettings};
pub use source::{DeviceSource, SerialSource, UsbSource};
pub use tracker::DeviceTracker;
