//! Configuration loading.
//!
//! Strongly-typed settings loaded with figment from:
//! 1. a `camctl.toml` file (base configuration)
//! 2. environment variables prefixed with `CAMCTL_`
//!
//! Every section has defaults, so the library works without a configuration
//! file and a file only needs the keys it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::controller::SetupOptions;
use crate::device::DEFAULT_REPLY_TIMEOUT;

/// Default configuration file path.
pub const DEFAULT_CONFIG_FILE: &str = "camctl.toml";

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Device access settings.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Controller setup settings.
    #[serde(default)]
    pub setup: SetupConfig,
    /// Temperature control settings.
    #[serde(default)]
    pub temperature: TemperatureConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Device access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device number into the sorted `/dev` node list.
    #[serde(default)]
    pub device_number: u32,
    /// Default image row count.
    #[serde(default = "default_rows")]
    pub rows: u32,
    /// Default image column count.
    #[serde(default = "default_cols")]
    pub cols: u32,
    /// Controller reply timeout.
    #[serde(with = "humantime_serde", default = "default_reply_timeout")]
    pub reply_timeout: Duration,
    /// Record every command round-trip in the command log.
    #[serde(default)]
    pub log_commands: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_number: 0,
            rows: default_rows(),
            cols: default_cols(),
            reply_timeout: default_reply_timeout(),
            log_commands: false,
        }
    }
}

/// Controller setup configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Reset the controller during setup.
    #[serde(default)]
    pub reset: bool,
    /// Run the data-link test sweep during setup.
    #[serde(default)]
    pub test_data_link: bool,
    /// Power the controller on during setup.
    #[serde(default = "default_true")]
    pub power_on: bool,
    /// Timing board firmware file.
    #[serde(default)]
    pub timing_file: Option<PathBuf>,
    /// Utility board firmware file.
    #[serde(default)]
    pub utility_file: Option<PathBuf>,
}

/// Temperature control configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemperatureConfig {
    /// Optional calibration constants file, loaded over the defaults.
    #[serde(default)]
    pub constants_file: Option<PathBuf>,
    /// Optional regulation target applied after setup, in Celsius.
    #[serde(default)]
    pub target_celsius: Option<f64>,
}

fn default_name() -> String {
    "camctl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rows() -> u32 {
    1024
}

fn default_cols() -> u32 {
    1024
}

fn default_reply_timeout() -> Duration {
    DEFAULT_REPLY_TIMEOUT
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Loads settings from `camctl.toml` and `CAMCTL_` environment
    /// variables.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Loads settings from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CAMCTL_").split("_"))
            .extract()
    }

    /// Validates the loaded settings.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.device.rows == 0 || self.device.cols == 0 {
            return Err(format!(
                "Invalid image dimensions {}x{}. Both must be non-zero",
                self.device.rows, self.device.cols
            ));
        }

        if self.device.reply_timeout.is_zero() || self.device.reply_timeout > Duration::from_secs(60)
        {
            return Err(format!(
                "Invalid reply_timeout {:?}. Must be between 1ms and 60s",
                self.device.reply_timeout
            ));
        }

        Ok(())
    }

    /// Builds the setup options for [`crate::controller::Controller::setup`].
    pub fn setup_options(&self) -> SetupOptions {
        SetupOptions {
            reset: self.setup.reset,
            test_data_link: self.setup.test_data_link,
            power_on: self.setup.power_on,
            rows: self.device.rows,
            cols: self.device.cols,
            timing_file: self.setup.timing_file.clone(),
            utility_file: self.setup.utility_file.clone(),
        }
    }
}
