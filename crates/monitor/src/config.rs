//! Monitor configuration management

use crate::filter::UsbFilter;
use crate::monitor::MonitorSettings;
use crate::udevadm::{DEFAULT_SERIAL_GLOBS, DEFAULT_SUBSYSTEMS};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Which listing the monitor diffs after each udev event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// USB-serial adapters (`/dev/ttyUSB*`, `/dev/ttyACM*`) via `udevadm info`
    #[default]
    Serial,
    /// Every USB device via `lsusb`
    Usb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default)]
    pub source: SourceKind,
    /// Delay between a udev event and re-listing devices
    #[serde(default = "MonitorSection::default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Delay before restarting a udev monitor that exited
    #[serde(default = "MonitorSection::default_restart_delay")]
    pub restart_delay_ms: u64,
    #[serde(default = "MonitorSection::default_subsystems")]
    pub subsystems: Vec<String>,
    /// Wrap `udevadm` in `stdbuf -oL`
    #[serde(default = "MonitorSection::default_line_buffered")]
    pub line_buffered: bool,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            settle_delay_ms: Self::default_settle_delay(),
            restart_delay_ms: Self::default_restart_delay(),
            subsystems: Self::default_subsystems(),
            line_buffered: Self::default_line_buffered(),
        }
    }
}

impl MonitorSection {
    fn default_settle_delay() -> u64 {
        100
    }

    fn default_restart_delay() -> u64 {
        1000
    }

    fn default_subsystems() -> Vec<String> {
        DEFAULT_SUBSYSTEMS.iter().map(|s| s.to_string()).collect()
    }

    fn default_line_buffered() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "SerialSettings::default_globs")]
    pub device_globs: Vec<String>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device_globs: Self::default_globs(),
        }
    }
}

impl SerialSettings {
    fn default_globs() -> Vec<String> {
        DEFAULT_SERIAL_GLOBS.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Use `lsusb -v` to pick up manufacturer/product/serial strings
    #[serde(default = "UsbSettings::default_verbose")]
    pub verbose: bool,
    /// VID:PID patterns; empty reports every device
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            verbose: Self::default_verbose(),
            filters: Vec::new(),
        }
    }
}

impl UsbSettings {
    fn default_verbose() -> bool {
        true
    }

    /// Parsed filters; entries are checked by [`MonitorConfig::validate`]
    pub fn parsed_filters(&self) -> Result<Vec<UsbFilter>> {
        self.filters
            .iter()
            .map(|f| UsbFilter::parse(f).map_err(|e| anyhow!(e)))
            .collect()
    }
}

impl MonitorConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/rpi-usb/monitor.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: MonitorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rpi-usb").join("monitor.toml")
        } else {
            PathBuf::from(".config/rpi-usb/monitor.toml")
        }
    }

    /// Settings for [`crate::DeviceMonitor`]
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            settle_delay: Duration::from_millis(self.monitor.settle_delay_ms),
            restart_delay: Duration::from_millis(self.monitor.restart_delay_ms),
            subsystems: self.monitor.subsystems.clone(),
            line_buffered: self.monitor.line_buffered,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.monitor.subsystems.is_empty() {
            return Err(anyhow!("At least one udev subsystem must be monitored"));
        }
        if self.monitor.subsystems.iter().any(|s| s.trim().is_empty()) {
            return Err(anyhow!("Udev subsystem names must not be blank"));
        }

        if self.serial.device_globs.is_empty() {
            return Err(anyhow!("At least one serial device glob is required"));
        }
        if self.serial.device_globs.iter().any(|g| g.trim().is_empty()) {
            return Err(anyhow!("Serial device globs must not be blank"));
        }

        for pattern in &self.serial.device_globs {
            glob::Pattern::new(pattern)
                .map_err(|e| anyhow!("Invalid device glob '{}': {}", pattern, e))?;
        }

        self.usb.parsed_filters()?;

        Ok(())
    }
}

/// Expand `~` in a user supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.monitor.source, SourceKind::Serial);
        assert_eq!(config.monitor.settle_delay_ms, 100);
        assert_eq!(config.monitor.restart_delay_ms, 1000);
        assert_eq!(config.serial.device_globs, vec!["/dev/ttyUSB*", "/dev/ttyACM*"]);
        assert!(config.usb.verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = MonitorConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: MonitorConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.general.log_level, parsed.general.log_level);
        assert_eq!(config.monitor.subsystems, parsed.monitor.subsystems);
        assert_eq!(config.serial.device_globs, parsed.serial.device_globs);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = MonitorConfig::default();
        config.general.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.general.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_lists() {
        let mut config = MonitorConfig::default();
        config.monitor.subsystems.clear();
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.serial.device_globs = vec!["  ".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_blank_entries() {
        let mut config = MonitorConfig::default();
        config.monitor.subsystems = vec!["tty".to_string(), "".to_string()];
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.serial.device_globs = vec!["/dev/ttyUSB*".to_string(), " ".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_filters() {
        let mut config = MonitorConfig::default();
        config.usb.filters = vec!["0x0403:*".to_string()];
        assert!(config.validate().is_ok());

        config.usb.filters.push("0403:6001".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_monitor_settings() {
        let mut config = MonitorConfig::default();
        config.monitor.settle_delay_ms = 250;
        config.monitor.line_buffered = false;

        let settings = config.monitor_settings();
        assert_eq!(settings.settle_delay, Duration::from_millis(250));
        assert_eq!(settings.restart_delay, Duration::from_secs(1));
        assert!(!settings.line_buffered);
    }
}
