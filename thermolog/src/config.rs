//! Configuration for the sensor monitor.
//!
//! [`MonitorConfig`] carries every tunable of the ingest pipeline: poll
//! timeout, raw retention, the hourly and daily rollups, flush cadence and
//! the log file layout. The defaults reproduce the fixed constants of the
//! field deployment (10 s poll, 24 h raw window, hourly averages kept for
//! 30 days, daily averages kept for a year, flush every 6 cycles).
//!
//! Configurations can be loaded from JSON. Missing fields take their
//! defaults and durations are written as seconds:
//!
//! ```json
//! {
//!   "poll_timeout": 10.0,
//!   "log_dir": "/var/log/thermolog",
//!   "hourly": { "every_cycles": 3600, "window": 3600.0, "retention": 2592000.0 }
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Cadence, averaging window and retention of one derived series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConfig {
    /// Number of ingest cycles between two averages.
    pub every_cycles: u64,

    /// How far back the average looks into the raw series.
    #[serde(with = "duration_serde")]
    pub window: Duration,

    /// How long averages are kept in the derived series.
    #[serde(with = "duration_serde")]
    pub retention: Duration,
}

impl RollupConfig {
    /// One average per 3600 cycles over the last hour, kept for 30 days.
    pub fn hourly() -> Self {
        Self {
            every_cycles: HOUR,
            window: Duration::from_secs(HOUR),
            retention: Duration::from_secs(30 * DAY),
        }
    }

    /// One average per 86400 cycles over the last day, kept for 365 days.
    pub fn daily() -> Self {
        Self {
            every_cycles: DAY,
            window: Duration::from_secs(DAY),
            retention: Duration::from_secs(365 * DAY),
        }
    }

    /// Validates this rollup. `name` is used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the cadence, window or retention
    /// is zero.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.every_cycles == 0 {
            return Err(invalid(format!("{name}.every_cycles cannot be zero")));
        }
        if self.window.is_zero() {
            return Err(invalid(format!("{name}.window cannot be zero")));
        }
        if self.retention.is_zero() {
            return Err(invalid(format!("{name}.retention cannot be zero")));
        }
        Ok(())
    }
}

/// Complete monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long one device read may block before the cycle continues empty.
    #[serde(with = "duration_serde")]
    pub poll_timeout: Duration,

    /// Baud rate used when opening the serial port.
    pub baud_rate: u32,

    /// Age after which raw readings are evicted, checked every cycle.
    #[serde(with = "duration_serde")]
    pub raw_retention: Duration,

    /// Hourly rollup.
    pub hourly: RollupConfig,

    /// Daily rollup.
    pub daily: RollupConfig,

    /// Number of ingest cycles between two flushes to disk.
    pub flush_every_cycles: u64,

    /// Directory holding the three log files.
    pub log_dir: PathBuf,

    /// File name of the raw reading log.
    pub raw_log: String,

    /// File name of the hourly average log.
    pub hourly_log: String,

    /// File name of the daily average log.
    pub daily_log: String,

    /// Compact the log files and reload their recent entries at start-up.
    pub restore_on_start: bool,

    /// Maximum number of fractional digits when rendering averages.
    pub average_precision: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(10),
            baud_rate: 115_200,
            raw_retention: Duration::from_secs(DAY),
            hourly: RollupConfig::hourly(),
            daily: RollupConfig::daily(),
            flush_every_cycles: 6,
            log_dir: PathBuf::from("."),
            raw_log: "log_temp.log".to_string(),
            hourly_log: "log_avg_temp_hour.log".to_string(),
            daily_log: "log_avg_temp_day.log".to_string(),
            restore_on_start: true,
            average_precision: 3,
        }
    }
}

impl MonitorConfig {
    /// Loads a configuration from a JSON file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON for this type, and
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(invalid("poll_timeout cannot be zero"));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud_rate cannot be zero"));
        }
        if self.raw_retention.is_zero() {
            return Err(invalid("raw_retention cannot be zero"));
        }
        if self.flush_every_cycles == 0 {
            return Err(invalid("flush_every_cycles cannot be zero"));
        }

        self.hourly.validate("hourly")?;
        self.daily.validate("daily")?;

        let mut seen = HashSet::new();
        for name in [&self.raw_log, &self.hourly_log, &self.daily_log] {
            if name.trim().is_empty() {
                return Err(invalid("log file names cannot be empty"));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("log file '{name}' is used twice")));
            }
        }

        Ok(())
    }

    /// Full path of the raw reading log.
    pub fn raw_log_path(&self) -> PathBuf {
        self.log_dir.join(&self.raw_log)
    }

    /// Full path of the hourly average log.
    pub fn hourly_log_path(&self) -> PathBuf {
        self.log_dir.join(&self.hourly_log)
    }

    /// Full path of the daily average log.
    pub fn daily_log_path(&self) -> PathBuf {
        self.log_dir.join(&self.daily_log)
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::ThermologError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
    .into()
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) for human readability
/// in JSON configuration files.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(D::Error::custom)
    }
}
