//! Device sources
//!
//! A [`DeviceSource`] produces the current device list on demand. The monitor
//! calls it once to baseline and again after every udev event.

use crate::filter::{UsbFilter, is_allowed};
use crate::{lsusb, udevadm};
use common::{CommandRunner, DeviceRecord, Result, SerialDevice, UsbDevice};
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

/// Something that can list the devices currently present
pub trait DeviceSource: Send + Sync + 'static {
    type Record: DeviceRecord;

    /// Short name used in log messages
    fn name(&self) -> &'static str;

    /// List the devices currently present
    fn list(&self) -> impl Future<Output = Result<Vec<Self::Record>>> + Send;
}

/// USB-serial adapters found through device node globs and `udevadm info`
pub struct SerialSource<R> {
    runner: Arc<R>,
    globs: Vec<String>,
}

impl<R: CommandRunner> SerialSource<R> {
    pub fn new(runner: Arc<R>, globs: Vec<String>) -> Self {
        Self { runner, globs }
    }

    /// Source over `/dev/ttyUSB*` and `/dev/ttyACM*`
    pub fn with_default_globs(runner: Arc<R>) -> Self {
        Self::new(
            runner,
            udevadm::DEFAULT_SERIAL_GLOBS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl<R: CommandRunner> DeviceSource for SerialSource<R> {
    type Record = SerialDevice;

    fn name(&self) -> &'static str {
        "udevadm"
    }

    async fn list(&self) -> Result<Vec<SerialDevice>> {
        Ok(udevadm::list_serial_devices(self.runner.as_ref(), self.globs.as_slice()).await)
    }
}

/// USB devices reported by `lsusb`
pub struct UsbSource<R> {
    runner: Arc<R>,
    verbose: bool,
    filters: Vec<UsbFilter>,
}

impl<R: CommandRunner> UsbSource<R> {
    pub fn new(runner: Arc<R>, verbose: bool) -> Self {
        Self {
            runner,
            verbose,
            filters: Vec::new(),
        }
    }

    /// Only report devices matching one of `filters`
    pub fn with_filters(mut self, filters: Vec<UsbFilter>) -> Self {
        self.filters = filters;
        self
    }
}

impl<R: CommandRunner> DeviceSource for UsbSource<R> {
    type Record = UsbDevice;

    fn name(&self) -> &'static str {
        "lsusb"
    }

    async fn list(&self) -> Result<Vec<UsbDevice>> {
        let mut devices = lsusb::list_usb_devices(self.runner.as_ref(), self.verbose).await?;
        devices.retain(|d| {
            let allowed = is_allowed(&self.filters, d.vendor_id, d.product_id);
            if !allowed {
                trace!("Device ignored by filter: {}", d.key());
            }
            allowed
        });
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{LSUSB_OUTPUT, ScriptedRunner};

    #[tokio::test]
    async fn test_usb_source_filters() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_stdout("lsusb", LSUSB_OUTPUT);

        let source = UsbSource::new(runner.clone(), false)
            .with_filters(vec![UsbFilter::parse("0x0424:*").unwrap()]);
        let devices = source.list().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.vendor_id == 0x0424));
        assert_eq!(source.name(), "lsusb");
    }

    #[tokio::test]
    async fn test_usb_source_propagates_errors() {
        let runner = Arc::new(ScriptedRunner::new());
        let source = UsbSource::new(runner, true);
        assert!(source.list().await.is_err());
    }

    #[tokio::test]
    async fn test_serial_source_without_devices() {
        let runner = Arc::new(ScriptedRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/ttyUSB*", dir.path().display());
        let source = SerialSource::new(runner.clone(), vec![pattern]);

        assert!(source.list().await.unwrap().is_empty());
        assert!(runner.calls().is_empty());
    }
}
