//! Operating system guard
//!
//! Everything in this workspace shells out to `lsusb` and `udevadm`, which
//! only exist on Linux.

use crate::{Error, Result};
use tracing::error;

/// Checks if the current platform is Linux
pub fn is_linux() -> bool {
    std::env::consts::OS == "linux"
}

/// Fail unless running on Linux
pub fn ensure_linux() -> Result<()> {
    ensure_supported(std::env::consts::OS)
}

/// Fail unless `os` names Linux
pub fn ensure_supported(os: &str) -> Result<()> {
    if os == "linux" {
        Ok(())
    } else {
        let err = Error::UnsupportedPlatform(os.to_string());
        error!("Error initializing USB: {}", err);
        Err(err)
    }
}
