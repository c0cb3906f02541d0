//! Application configuration using Figment
//!
//! Configuration is merged from, in increasing priority:
//! 1. built-in defaults
//! 2. `config/transport_daq.toml` (or the file given with `--config`)
//! 3. environment variables prefixed with `TRANSPORT_DAQ_`, nested keys
//!    separated by a double underscore
//!
//! # Example
//! ```no_run
//! use transport_daq::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // TRANSPORT_DAQ_APPLICATION__LOG_LEVEL=debug overrides the file
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Writing to {}", config.storage.output_dir.display());
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::registry::{DeviceConfig, DriverType};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/transport_daq.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "TRANSPORT_DAQ_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Result files
    #[serde(default)]
    pub storage: StorageConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "transport_daq".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

/// Where result files are written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory, created on first write
    pub output_dir: PathBuf,
    /// File name prefix; the procedure type is used when empty
    #[serde(default)]
    pub file_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            file_prefix: String::new(),
        }
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier, referenced by procedure roles
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Whether this instrument is connected at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver, bus address and driver settings
    pub driver: DriverType,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No configuration file at {}", path.display());
        }
        Ok(Self::figment(path).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if !LOG_FORMATS.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                return Err(DaqError::Configuration(
                    "Instrument with an empty id".to_string(),
                ));
            }
            if !ids.insert(&instrument.id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .collect()
    }

    /// Registry entries for the enabled instruments.
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.enabled_instruments()
            .into_iter()
            .map(|inst| DeviceConfig {
                id: inst.id.clone(),
                name: if inst.name.is_empty() {
                    inst.id.clone()
                } else {
                    inst.name.clone()
                },
                driver: inst.driver.clone(),
            })
            .collect()
    }
}
