//! Device record and change event tests
//!
//! Covers the identity keys the monitor diffs on and the JSON shape the CLI
//! emits for `--json`.
//!
//! Run with: `cargo test -p common --test device_types_tests`

use common::test_utils::{create_mock_serial_device, create_mock_usb_device};
use common::{ChangeKind, DeviceChangeEvent, DeviceRecord, SerialDevice, UdevProperty, UsbDevice};

// ============================================================================
// Identity Tests
// ============================================================================

#[test]
fn test_usb_key_is_bus_and_address() {
    let device = create_mock_usb_device(1, 4, 0x0bda, 0x8179);
    assert_eq!(device.key(), "001:004");

    // Same VID:PID on another port is a different device
    let twin = create_mock_usb_device(1, 5, 0x0bda, 0x8179);
    assert_ne!(device.key(), twin.key());
}

#[test]
fn test_serial_key_is_devpath() {
    let devpath = "/devices/platform/soc/usb1/1-1/ttyUSB0";
    let device = create_mock_serial_device("/dev/ttyUSB0", devpath);
    assert_eq!(device.key(), devpath);
}

// ============================================================================
// Summary Tests
// ============================================================================

#[test]
fn test_usb_summary_prefers_product_string() {
    let mut device = UsbDevice::new(1, 5, 0x0403, 0x6001);
    assert_eq!(device.summary(), "Bus 001 Device 005: ID 0403:6001");

    device.description =
        Some("Future Technology Devices International, Ltd FT232 Serial (UART) IC".to_string());
    assert!(device.summary().ends_with("FT232 Serial (UART) IC"));

    device.product = Some("FT232R USB UART".to_string());
    assert_eq!(device.summary(), "Bus 001 Device 005: ID 0403:6001 FT232R USB UART");
}

#[test]
fn test_serial_summary() {
    let device = create_mock_serial_device("/dev/ttyUSB0", "/devices/a");
    assert_eq!(device.summary(), "/dev/ttyUSB0 0403:6001 FT232R_USB_UART (serial A50285BI)");

    let mut bare = SerialDevice::default();
    bare.set(UdevProperty::DevName, "/dev/ttyACM0");
    assert_eq!(bare.summary(), "/dev/ttyACM0");
}

// ============================================================================
// JSON Tests
// ============================================================================

#[test]
fn test_event_json_shape() {
    let event = DeviceChangeEvent::detach(create_mock_usb_device(1, 4, 0x0bda, 0x8179));
    let json = serde_json::to_value(&event).unwrap();

    assert_eq!(json["type"], "detach");
    assert_eq!(json["device"]["bus_number"], 1);
    assert_eq!(json["device"]["vendor_id"], 0x0bda);
    assert!(json["device"]["serial_number"].is_null());
}

#[test]
fn test_serial_device_json_uses_udev_keys() {
    let device = create_mock_serial_device("/dev/ttyUSB0", "/devices/a");
    let json = serde_json::to_value(&device).unwrap();

    for property in UdevProperty::ALL {
        assert_eq!(json[property.as_str()], device.get(property), "{}", property.as_str());
    }

    // Missing keys deserialize as empty strings
    let parsed: SerialDevice = serde_json::from_str(r#"{"DEVNAME": "/dev/ttyACM0"}"#).unwrap();
    assert_eq!(parsed.devname, "/dev/ttyACM0");
    assert_eq!(parsed.devpath, "");
}

#[test]
fn test_change_kind_display() {
    assert_eq!(ChangeKind::Attach.to_string(), "attach");
    assert_eq!(ChangeKind::Detach.to_string(), "detach");
}
