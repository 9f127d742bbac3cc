/*!
Configuration management for the chip control tool.
*/

use anyhow::{Context, Result};
use chipcodec::{ChipDescriptor, ShiftDirection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub registers: RegistersConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Descriptor of the configured chip
    pub fn chip(&self) -> Result<ChipDescriptor> {
        ChipDescriptor::by_name(&self.device.chip)
            .with_context(|| "Invalid [device] chip setting")
    }
}

/// Device specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Chip type, one of the built-in descriptors
    pub chip: String,

    /// Matrix definition file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix: Option<PathBuf>,

    /// Matrix configuration attempts before giving up
    pub retry_matrix_config: u32,

    /// Pixels run with the long counter (ToA only)
    pub long_counter: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            chip: "clictd".to_string(),
            matrix: None,
            retry_matrix_config: chipcodec::device::DEFAULT_RETRY_MATRIX_CONFIG,
            long_counter: false,
        }
    }
}

/// Configuration register settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistersConfig {
    /// Register layout file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<PathBuf>,

    /// Shift direction used for bit vector generation
    pub direction: ShiftDirection,
}

/// Output formatting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Hex,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,

    /// Default log filter, overridden by RUST_LOG and --verbose
    pub log_level: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Hex,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::new();
        original_config.device.matrix = Some(PathBuf::from("matrix.cfg"));
        original_config.registers.direction = ShiftDirection::LsbFirst;

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        // Save and load
        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(original_config, loaded_config);
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.device.chip, "clictd");
        assert_eq!(config.device.retry_matrix_config, 3);
        assert!(config.device.matrix.is_none());
        assert!(!config.device.long_counter);
        assert_eq!(config.registers.direction, ShiftDirection::MsbFirst);
        assert_eq!(config.output.format, OutputFormat::Hex);
        assert_eq!(config.chip().unwrap().name, "clictd");
    }

    #[test]
    fn test_partial_file() {
        let config: AppConfig = toml::from_str(
            r#"
            [device]
            chip = "CLICpix2"
            retry_matrix_config = 5

            [output]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.retry_matrix_config, 5);
        assert_eq!(config.chip().unwrap().name, "clicpix2");
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.output.log_level, "info");
        assert!(config.registers.layout.is_none());
    }

    #[test]
    fn test_unknown_chip() {
        let mut config = AppConfig::new();
        config.device.chip = "timepix".to_string();
        assert!(config.chip().is_err());
    }
}
