//! The ingest loop: one device read per cycle, routed through the series.
//!
//! [`IngestLoop`] owns the three series (raw readings, hourly averages,
//! daily averages), the two rollups and the disk sync. Each call to
//! [`IngestLoop::run_cycle`] performs, in order:
//!
//! 1. one blocking device read (bounded by the device timeout)
//! 2. validation; a valid reading is appended to the raw series
//! 3. raw-series eviction, whether or not a reading arrived
//! 4. the hourly and daily rollup ticks
//! 5. the disk sync tick
//!
//! [`IngestLoop::run`] repeats this forever. Nothing in a cycle is fatal:
//! device, parse and file errors are logged and the next cycle proceeds.
//!
//! # Example
//!
//! ```rust
//! use thermolog::{IngestLoop, MonitorConfig, Reading, ScriptedDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let config = MonitorConfig {
//!     log_dir: dir.path().to_path_buf(),
//!     ..MonitorConfig::default()
//! };
//! let mut ingest = IngestLoop::new(config)?;
//! let mut device = ScriptedDevice::new(["23.5", "abc"]);
//!
//! let report = ingest.run_cycle(&mut device);
//! assert_eq!(report.reading, Reading::Accepted("23.5".to_string()));
//! let report = ingest.run_cycle(&mut device);
//! assert_eq!(report.reading, Reading::Rejected("abc".to_string()));
//! assert_eq!(ingest.raw().len(), 1);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::thread;

use crate::aggregate::Rollup;
use crate::config::MonitorConfig;
use crate::device::Device;
use crate::error::Result;
use crate::series::TimeSeries;
use crate::sync::{DiskSync, LogFile};
use crate::timecodec::{Clock, SystemClock};

/// Returns true if `token` is a reading worth storing: non-empty, free of
/// NUL bytes and made only of ASCII digits, `.` and `-`.
///
/// The check is purely lexical, so `"1.2.3"` or `"-"` pass here and are
/// skipped later when averages are computed.
///
/// ```rust
/// use thermolog::is_valid_reading;
///
/// assert!(is_valid_reading("23.5"));
/// assert!(is_valid_reading("-4"));
/// assert!(!is_valid_reading(""));
/// assert!(!is_valid_reading("19.9\0"));
/// assert!(!is_valid_reading("Iteration"));
/// ```
pub fn is_valid_reading(token: &str) -> bool {
    !token.is_empty()
        && !token.contains('\0')
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
}

/// What the device produced in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// A valid reading, appended to the raw series.
    Accepted(String),
    /// A non-empty token that failed validation.
    Rejected(String),
    /// Nothing arrived before the read timeout.
    Empty,
    /// The device read failed; the message describes why.
    Failed(String),
}

/// Summary of one ingest cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Outcome of the device read.
    pub reading: Reading,
    /// Raw entries evicted this cycle.
    pub evicted: usize,
    /// Hourly average recorded this cycle, if the rollup fired.
    pub hourly: Option<f64>,
    /// Daily average recorded this cycle, if the rollup fired.
    pub daily: Option<f64>,
    /// Whether the series were flushed to disk this cycle.
    pub flushed: bool,
}

/// Single-producer pipeline from device tokens to series and log files.
#[derive(Debug)]
pub struct IngestLoop {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    raw: Arc<TimeSeries>,
    hourly: Arc<TimeSeries>,
    daily: Arc<TimeSeries>,
    hourly_rollup: Rollup,
    daily_rollup: Rollup,
    sync: DiskSync,
    cycles: u64,
}

impl IngestLoop {
    /// Creates an ingest loop stamped by the local wall clock.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::ConfigError`] if the configuration is invalid.
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an ingest loop whose series are stamped by `clock`.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::ConfigError`] if the configuration is invalid.
    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let raw = Arc::new(TimeSeries::with_clock("raw", clock.clone()));
        let hourly = Arc::new(TimeSeries::with_clock("hourly", clock.clone()));
        let daily = Arc::new(TimeSeries::with_clock("daily", clock.clone()));

        let mut sync = DiskSync::new(config.flush_every_cycles);
        sync.add_target(
            raw.clone(),
            LogFile::new(config.raw_log_path()),
            config.raw_retention,
        );
        sync.add_target(
            hourly.clone(),
            LogFile::new(config.hourly_log_path()),
            config.hourly.retention,
        );
        sync.add_target(
            daily.clone(),
            LogFile::new(config.daily_log_path()),
            config.daily.retention,
        );

        let hourly_rollup = Rollup::new("hourly", config.hourly.clone(), config.average_precision);
        let daily_rollup = Rollup::new("daily", config.daily.clone(), config.average_precision);

        Ok(Self {
            config,
            clock,
            raw,
            hourly,
            daily,
            hourly_rollup,
            daily_rollup,
            sync,
            cycles: 0,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Raw readings.
    pub fn raw(&self) -> &Arc<TimeSeries> {
        &self.raw
    }

    /// Hourly averages.
    pub fn hourly(&self) -> &Arc<TimeSeries> {
        &self.hourly
    }

    /// Daily averages.
    pub fn daily(&self) -> &Arc<TimeSeries> {
        &self.daily
    }

    /// The hourly rollup and its cycle counter.
    pub fn hourly_rollup(&self) -> &Rollup {
        &self.hourly_rollup
    }

    /// The daily rollup and its cycle counter.
    pub fn daily_rollup(&self) -> &Rollup {
        &self.daily_rollup
    }

    /// Cycles run since creation.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Reloads recent history from the log files into the empty series.
    ///
    /// Only takes effect before the first cycle; later calls are skipped with
    /// a warning. Returns the number of entries restored.
    pub fn restore(&mut self) -> usize {
        self.sync.restore_all(self.clock.now())
    }

    /// Flushes every series to disk now, outside the normal cadence.
    pub fn flush(&mut self) -> usize {
        self.sync.flush_all()
    }

    /// Runs one cycle: read, validate, append, evict, roll up, flush.
    pub fn run_cycle<D: Device + ?Sized>(&mut self, device: &mut D) -> CycleReport {
        self.cycles += 1;

        let reading = match device.read_token() {
            Ok(token) if token.is_empty() => Reading::Empty,
            Ok(token) if is_valid_reading(&token) => {
                self.raw.append(token.as_str());
                tracing::info!(reading = %token, "got reading");
                Reading::Accepted(token)
            }
            Ok(token) => {
                tracing::info!(token = ?token, "ignoring malformed token");
                Reading::Rejected(token)
            }
            Err(e) => {
                tracing::warn!("device read failed: {e}");
                Reading::Failed(e.to_string())
            }
        };

        let evicted = self.raw.evict(self.config.raw_retention);
        let hourly = self.hourly_rollup.tick(&self.raw, &self.hourly);
        let daily = self.daily_rollup.tick(&self.raw, &self.daily);
        let flushed = self.sync.tick(self.clock.now());

        tracing::debug!(
            cycle = self.cycles,
            raw_len = self.raw.len(),
            evicted,
            flushed,
            "cycle complete"
        );

        CycleReport {
            reading,
            evicted,
            hourly,
            daily,
            flushed,
        }
    }

    /// Runs cycles forever, calling `on_cycle` after each one.
    ///
    /// A failed read returns immediately instead of waiting for the timeout,
    /// so the loop sleeps for the poll timeout after one to keep the cycle
    /// length, and with it the rollup cadence, close to normal.
    pub fn run<D, F>(&mut self, device: &mut D, mut on_cycle: F) -> !
    where
        D: Device + ?Sized,
        F: FnMut(&CycleReport),
    {
        loop {
            let report = self.run_cycle(device);
            on_cycle(&report);
            if matches!(report.reading, Reading::Failed(_)) {
                thread::sleep(self.config.poll_timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ScriptedDevice;
    use crate::timecodec::ManualClock;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (Arc<ManualClock>, IngestLoop) {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let config = MonitorConfig {
            log_dir: dir.to_path_buf(),
            ..MonitorConfig::default()
        };
        let ingest = IngestLoop::with_clock(config, clock.clone()).unwrap();
        (clock, ingest)
    }

    #[test]
    fn test_is_valid_reading() {
        for ok in ["23.5", "0", "-12.25", "1.2.3", "-", "."] {
            assert!(is_valid_reading(ok), "{ok:?} should be accepted");
        }
        for bad in ["", "abc", "23.5C", "19.9\0", " 23.5", "+1", "1e3", "２３"] {
            assert!(!is_valid_reading(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MonitorConfig {
            flush_every_cycles: 0,
            ..MonitorConfig::default()
        };
        assert!(IngestLoop::new(config).is_err());
    }

    #[test]
    fn test_cycle_outcomes() {
        let dir = tempdir().unwrap();
        let (_clock, mut ingest) = setup(dir.path());
        let mut device = ScriptedDevice::new(["23.5", "abc", "", "19.9\0"]);

        let readings: Vec<Reading> = (0..4)
            .map(|_| ingest.run_cycle(&mut device).reading)
            .collect();
        assert_eq!(
            readings,
            vec![
                Reading::Accepted("23.5".to_string()),
                Reading::Rejected("abc".to_string()),
                Reading::Empty,
                Reading::Rejected("19.9\0".to_string()),
            ]
        );
        assert_eq!(ingest.raw().len(), 1);
        assert_eq!(ingest.cycles(), 4);
    }

    #[test]
    fn test_device_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let (_clock, mut ingest) = setup(dir.path());
        let mut device = ScriptedDevice::new(["23.5"]);
        device.close();

        let report = ingest.run_cycle(&mut device);
        assert!(matches!(report.reading, Reading::Failed(_)));
        assert_eq!(ingest.hourly_rollup().counter(), 1);
        assert_eq!(ingest.daily_rollup().counter(), 1);
    }

    #[test]
    fn test_raw_eviction_runs_every_cycle() {
        let dir = tempdir().unwrap();
        let (clock, mut ingest) = setup(dir.path());
        let mut device = ScriptedDevice::new(["20.0"]);

        ingest.run_cycle(&mut device);
        assert_eq!(ingest.raw().len(), 1);

        clock.advance(Duration::from_secs(86_400));
        let report = ingest.run_cycle(&mut device);
        assert_eq!(report.reading, Reading::Empty);
        assert_eq!(report.evicted, 1);
        assert!(ingest.raw().is_empty());
    }

    #[test]
    fn test_flush_cadence() {
        let dir = tempdir().unwrap();
        let (_clock, mut ingest) = setup(dir.path());
        let mut device = ScriptedDevice::new(["21.0"]);

        let flushed: Vec<bool> = (0..12)
            .map(|_| ingest.run_cycle(&mut device).flushed)
            .collect();
        let expected: Vec<bool> = (1..=12).map(|i| i % 6 == 0).collect();
        assert_eq!(flushed, expected);

        let written = std::fs::read_to_string(dir.path().join("log_temp.log")).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.ends_with(": 21.0\n"));
    }
}
