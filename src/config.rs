//! Engine configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/ion_daq.toml` by default)
//! 2. environment variables prefixed with `ION_DAQ_`, sections separated by a
//!    double underscore (`ION_DAQ_PULSER__QUEUE_DEPTH=8192`)
//!
//! Every field has a default, so a missing or empty file yields a working
//! configuration.
//!
//! # Example
//! ```no_run
//! use ion_daq::config::EngineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::trace::TraceFormat;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/ion_daq.toml";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Sequencer transport settings
    pub pulser: PulserConfig,
    /// Scan controller settings
    pub scan: ScanConfig,
    /// Trace storage settings
    pub storage: StorageConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "ion-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Sequencer transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulserConfig {
    /// Reply / read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Bound of the reader packet queue
    pub queue_depth: usize,
    /// Hardware write FIFO limit in words
    pub fifo_depth: usize,
    /// Update words written before the program starts
    pub max_init_updates: usize,
    /// Read back every RAM write
    pub verify_ram: bool,
    /// Bad-CRC fraction of records that interrupts a run
    pub crc_error_limit: f64,
    /// Window of the bad-CRC rate in milliseconds
    pub crc_window_ms: u64,
    /// Records a window must hold before the limit applies
    pub crc_min_records: u64,
}

impl Default for PulserConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 500,
            queue_depth: 4096,
            fifo_depth: 1020,
            max_init_updates: 1000,
            verify_ram: true,
            crc_error_limit: 0.01,
            crc_window_ms: 1000,
            crc_min_records: 100,
        }
    }
}

impl PulserConfig {
    /// Reply / read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Window of the bad-CRC rate.
    pub fn crc_window(&self) -> Duration {
        Duration::from_millis(self.crc_window_ms)
    }
}

/// Scan controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Settle poll period in milliseconds
    pub settle_poll_ms: u64,
    /// Settle timeout for parameters that do not define one
    pub default_settle_timeout_ms: u64,
    /// Upper bound for an abort to reach idle
    pub abort_timeout_ms: u64,
    /// Interrupt the run on any timing violation
    pub timing_violations_fatal: bool,
    /// Bins of per-point histograms
    pub histogram_bins: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            settle_poll_ms: 100,
            default_settle_timeout_ms: 10_000,
            abort_timeout_ms: 500,
            timing_violations_fatal: false,
            histogram_bins: 64,
        }
    }
}

impl ScanConfig {
    /// Settle poll period.
    pub fn settle_poll(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms)
    }

    /// Default settle timeout.
    pub fn default_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.default_settle_timeout_ms)
    }

    /// Abort deadline.
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
}

/// Trace storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for trace files
    pub output_dir: PathBuf,
    /// Default trace file format
    pub format: TraceFormat,
    /// Periodic commit cadence in seconds (0 = only at finalization)
    pub commit_interval_secs: u64,
    /// Backing file of the key-value configuration store
    pub config_store: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            format: TraceFormat::Text,
            commit_interval_secs: 60,
            config_store: PathBuf::from("config/store.json"),
        }
    }
}

impl StorageConfig {
    /// Periodic commit cadence, `None` if disabled.
    pub fn commit_interval(&self) -> Option<Duration> {
        (self.commit_interval_secs > 0).then(|| Duration::from_secs(self.commit_interval_secs))
    }
}

impl EngineConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ION_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let pulser = &self.pulser;
        if pulser.queue_depth == 0 {
            return Err(DaqError::Configuration(
                "pulser.queue_depth must be at least 1".into(),
            ));
        }
        if pulser.fifo_depth == 0 {
            return Err(DaqError::Configuration(
                "pulser.fifo_depth must be at least 1".into(),
            ));
        }
        if pulser.max_init_updates > pulser.fifo_depth {
            return Err(DaqError::Configuration(format!(
                "pulser.max_init_updates ({}) exceeds pulser.fifo_depth ({})",
                pulser.max_init_updates, pulser.fifo_depth
            )));
        }
        if !(0.0..=1.0).contains(&pulser.crc_error_limit) {
            return Err(DaqError::Configuration(format!(
                "pulser.crc_error_limit {} must be within 0-1",
                pulser.crc_error_limit
            )));
        }
        if pulser.read_timeout_ms == 0 || self.scan.settle_poll_ms == 0 {
            return Err(DaqError::Configuration(
                "timeouts and poll periods must be positive".into(),
            ));
        }
        if self.scan.histogram_bins == 0 {
            return Err(DaqError::Configuration(
                "scan.histogram_bins must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
