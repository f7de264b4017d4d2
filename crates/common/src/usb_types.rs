//! USB device records and change events
//!
//! Two kinds of records are produced: [`UsbDevice`] from `lsusb` output and
//! [`SerialDevice`] from `udevadm info` output. Both implement
//! [`DeviceRecord`], which gives the monitor a stable identity to diff on.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A device that can be tracked across listings
pub trait DeviceRecord: Clone + Debug + Serialize + Send + Sync + 'static {
    /// Stable identity of the device; two listings report the same device
    /// when their keys are equal.
    fn key(&self) -> String;

    /// One-line human readable description
    fn summary(&self) -> String;
}

/// USB device as reported by `lsusb`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    pub bus_number: u16,
    pub device_address: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Text following the `ID vvvv:pppp` pair on the header line
    pub description: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl UsbDevice {
    pub fn new(bus_number: u16, device_address: u16, vendor_id: u16, product_id: u16) -> Self {
        Self {
            bus_number,
            device_address,
            vendor_id,
            product_id,
            description: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl DeviceRecord for UsbDevice {
    fn key(&self) -> String {
        format!("{:03}:{:03}", self.bus_number, self.device_address)
    }

    fn summary(&self) -> String {
        let mut line = format!(
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus_number, self.device_address, self.vendor_id, self.product_id
        );
        let name = self
            .product
            .as_deref()
            .or(self.description.as_deref())
            .filter(|s| !s.is_empty());
        if let Some(name) = name {
            line.push(' ');
            line.push_str(name);
        }
        line
    }
}

/// udev properties collected for serial devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UdevProperty {
    DevName,
    DevPath,
    Subsystem,
    IdBus,
    IdVendor,
    IdVendorId,
    IdVendorFromDatabase,
    IdModel,
    IdModelId,
    IdModelFromDatabase,
    IdSerial,
    IdSerialShort,
    IdPath,
    IdUsbDriver,
    IdUsbInterfaceNum,
    DevLinks,
}

impl UdevProperty {
    pub const ALL: [UdevProperty; 16] = [
        UdevProperty::DevName,
        UdevProperty::DevPath,
        UdevProperty::Subsystem,
        UdevProperty::IdBus,
        UdevProperty::IdVendor,
        UdevProperty::IdVendorId,
        UdevProperty::IdVendorFromDatabase,
        UdevProperty::IdModel,
        UdevProperty::IdModelId,
        UdevProperty::IdModelFromDatabase,
        UdevProperty::IdSerial,
        UdevProperty::IdSerialShort,
        UdevProperty::IdPath,
        UdevProperty::IdUsbDriver,
        UdevProperty::IdUsbInterfaceNum,
        UdevProperty::DevLinks,
    ];

    /// The udev environment key
    pub fn as_str(self) -> &'static str {
        match self {
            UdevProperty::DevName => "DEVNAME",
            UdevProperty::DevPath => "DEVPATH",
            UdevProperty::Subsystem => "SUBSYSTEM",
            UdevProperty::IdBus => "ID_BUS",
            UdevProperty::IdVendor => "ID_VENDOR",
            UdevProperty::IdVendorId => "ID_VENDOR_ID",
            UdevProperty::IdVendorFromDatabase => "ID_VENDOR_FROM_DATABASE",
            UdevProperty::IdModel => "ID_MODEL",
            UdevProperty::IdModelId => "ID_MODEL_ID",
            UdevProperty::IdModelFromDatabase => "ID_MODEL_FROM_DATABASE",
            UdevProperty::IdSerial => "ID_SERIAL",
            UdevProperty::IdSerialShort => "ID_SERIAL_SHORT",
            UdevProperty::IdPath => "ID_PATH",
            UdevProperty::IdUsbDriver => "ID_USB_DRIVER",
            UdevProperty::IdUsbInterfaceNum => "ID_USB_INTERFACE_NUM",
            UdevProperty::DevLinks => "DEVLINKS",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == key)
    }
}

/// USB-serial device as reported by `udevadm info -q all`
///
/// Properties missing from the udev database are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct SerialDevice {
    pub devname: String,
    pub devpath: String,
    pub subsystem: String,
    pub id_bus: String,
    pub id_vendor: String,
    pub id_vendor_id: String,
    pub id_vendor_from_database: String,
    pub id_model: String,
    pub id_model_id: String,
    pub id_model_from_database: String,
    pub id_serial: String,
    pub id_serial_short: String,
    pub id_path: String,
    pub id_usb_driver: String,
    pub id_usb_interface_num: String,
    pub devlinks: String,
}

impl SerialDevice {
    pub fn get(&self, property: UdevProperty) -> &str {
        match property {
            UdevProperty::DevName => &self.devname,
            UdevProperty::DevPath => &self.devpath,
            UdevProperty::Subsystem => &self.subsystem,
            UdevProperty::IdBus => &self.id_bus,
            UdevProperty::IdVendor => &self.id_vendor,
            UdevProperty::IdVendorId => &self.id_vendor_id,
            UdevProperty::IdVendorFromDatabase => &self.id_vendor_from_database,
            UdevProperty::IdModel => &self.id_model,
            UdevProperty::IdModelId => &self.id_model_id,
            UdevProperty::IdModelFromDatabase => &self.id_model_from_database,
            UdevProperty::IdSerial => &self.id_serial,
            UdevProperty::IdSerialShort => &self.id_serial_short,
            UdevProperty::IdPath => &self.id_path,
            UdevProperty::IdUsbDriver => &self.id_usb_driver,
            UdevProperty::IdUsbInterfaceNum => &self.id_usb_interface_num,
            UdevProperty::DevLinks => &self.devlinks,
        }
    }

    pub fn set(&mut self, property: UdevProperty, value: impl Into<String>) {
        let slot = match property {
            UdevProperty::DevName => &mut self.devname,
            UdevProperty::DevPath => &mut self.devpath,
            UdevProperty::Subsystem => &mut self.subsystem,
            UdevProperty::IdBus => &mut self.id_bus,
            UdevProperty::IdVendor => &mut self.id_vendor,
            UdevProperty::IdVendorId => &mut self.id_vendor_id,
            UdevProperty::IdVendorFromDatabase => &mut self.id_vendor_from_database,
            UdevProperty::IdModel => &mut self.id_model,
            UdevProperty::IdModelId => &mut self.id_model_id,
            UdevProperty::IdModelFromDatabase => &mut self.id_model_from_database,
            UdevProperty::IdSerial => &mut self.id_serial,
            UdevProperty::IdSerialShort => &mut self.id_serial_short,
            UdevProperty::IdPath => &mut self.id_path,
            UdevProperty::IdUsbDriver => &mut self.id_usb_driver,
            UdevProperty::IdUsbInterfaceNum => &mut self.id_usb_interface_num,
            UdevProperty::DevLinks => &mut self.devlinks,
        };
        *slot = value.into();
    }
}

impl DeviceRecord for SerialDevice {
    fn key(&self) -> String {
        self.devpath.clone()
    }

    fn summary(&self) -> String {
        let mut line = self.devname.clone();
        if !self.id_vendor_id.is_empty() || !self.id_model_id.is_empty() {
            line.push_str(&format!(" {}:{}", self.id_vendor_id, self.id_model_id));
        }
        let model = if self.id_model_from_database.is_empty() {
            &self.id_model
        } else {
            &self.id_model_from_database
        };
        if !model.is_empty() {
            line.push(' ');
            line.push_str(model);
        }
        if !self.id_serial_short.is_empty() {
            line.push_str(&format!(" (serial {})", self.id_serial_short));
        }
        line
    }
}

/// Direction of a device transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Attach,
    Detach,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Attach => write!(f, "attach"),
            ChangeKind::Detach => write!(f, "detach"),
        }
    }
}

/// A device appearing in or disappearing from the known-device snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceChangeEvent<D> {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub device: D,
}

impl<D> DeviceChangeEvent<D> {
    pub fn attach(device: D) -> Self {
        Self {
            kind: ChangeKind::Attach,
            device,
        }
    }

    pub fn detach(device: D) -> Self {
        Self {
            kind: ChangeKind::Detach,
            device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_device_key_and_summary() {
        let mut device = UsbDevice::new(1, 4, 0x0bda, 0x8179);
        device.description = Some("Realtek Semiconductor Corp. RTL8188EUS".to_string());
        assert_eq!(device.key(), "001:004");
        assert_eq!(
            device.summary(),
            "Bus 001 Device 004: ID 0bda:8179 Realtek Semiconductor Corp. RTL8188EUS"
        );

        // product string wins over the lsusb description
        device.product = Some("802.11n NIC".to_string());
        assert!(device.summary().ends_with("802.11n NIC"));
    }

    #[test]
    fn test_udev_property_lookup() {
        for property in UdevProperty::ALL {
            assert_eq!(UdevProperty::from_key(property.as_str()), Some(property));
        }
        assert_eq!(UdevProperty::from_key("MAJOR"), None);
    }

    #[test]
    fn test_serial_device_get_set() {
        let mut device = SerialDevice::default();
        for property in UdevProperty::ALL {
            device.set(property, property.as_str().to_lowercase());
        }
        for property in UdevProperty::ALL {
            assert_eq!(device.get(property), property.as_str().to_lowercase());
        }
        assert_eq!(device.key(), "devpath");
    }

    #[test]
    fn test_serial_device_serializes_with_udev_keys() {
        let mut device = SerialDevice::default();
        device.set(UdevProperty::DevName, "/dev/ttyUSB0");
        device.set(UdevProperty::IdVendorId, "0403");

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["DEVNAME"], "/dev/ttyUSB0");
        assert_eq!(json["ID_VENDOR_ID"], "0403");
        assert_eq!(json["ID_SERIAL_SHORT"], "");
        assert_eq!(json["DEVLINKS"], "");
    }

    #[test]
    fn test_serial_summary() {
        let mut device = SerialDevice::default();
        device.set(UdevProperty::DevName, "/dev/ttyUSB0");
        assert_eq!(device.summary(), "/dev/ttyUSB0");

        device.set(UdevProperty::IdVendorId, "0403");
        device.set(UdevProperty::IdModelId, "6001");
        device.set(UdevProperty::IdModel, "FT232R_USB_UART");
        device.set(UdevProperty::IdSerialShort, "A50285BI");
        assert_eq!(
            device.summary(),
            "/dev/ttyUSB0 0403:6001 FT232R_USB_UART (serial A50285BI)"
        );
    }

    #[test]
    fn test_change_event_serialization() {
        let event = DeviceChangeEvent::attach(UsbDevice::new(1, 2, 0x1d6b, 0x0002));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "attach");
        assert_eq!(json["device"]["vendor_id"], 0x1d6b);

        let event = DeviceChangeEvent::detach(SerialDevice::default());
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "detach");
        assert_eq!(event.kind.to_string(), "detach");
    }
}
