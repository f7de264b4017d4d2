//! USB device filters
//!
//! Filters restrict which `lsusb` devices are reported. Format is
//! `0xVID:0xPID`, where either half may be `*`.

use common::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl UsbFilter {
    /// Parse a `VID:PID` pattern
    pub fn parse(filter: &str) -> Result<Self> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(Error::Config(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            )));
        }

        Ok(Self {
            vendor_id: Self::parse_id(parts[0], "VID")?,
            product_id: Self::parse_id(parts[1], "PID")?,
        })
    }

    /// Parse one half of a filter; `*` matches anything
    fn parse_id(id: &str, name: &str) -> Result<Option<u16>> {
        if id == "*" {
            return Ok(None);
        }

        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                Error::Config(format!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name, id
                ))
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(Error::Config(format!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name, id
            )));
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| {
                Error::Config(format!("Invalid {} '{}', not a valid hex number", name, id))
            })
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

/// Check if a VID/PID pair is allowed by the filters
///
/// An empty filter list allows every device.
pub fn is_allowed(filters: &[UsbFilter], vendor_id: u16, product_id: u16) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
}
