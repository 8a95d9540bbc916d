//! Periodic rollups from the raw series into derived average series.
//!
//! A [`Rollup`] counts ingest cycles. When the count reaches the configured
//! threshold it averages the source series over its window, appends the
//! rendered average to the derived series, resets the count and trims the
//! derived series to its retention.
//!
//! # Cadence
//!
//! Cycles, not wall-clock time, drive the threshold. A cycle lasts as long
//! as one device read, so when reads stall past their timeout the rollups
//! fire later than the nominal hour/day. The averaging window itself is
//! measured against timestamps, so each average still covers the right
//! stretch of readings.
//!
//! ```text
//! raw ──(every N cycles: average over window)──► derived ──evict(retention)
//! ```

use crate::config::RollupConfig;
use crate::series::TimeSeries;

/// Renders an average with at most `precision` fractional digits.
///
/// Trailing zeros are trimmed but one fractional digit is always kept, so
/// whole numbers read as `25.0`. Non-finite values render as `0.0`.
///
/// ```rust
/// use thermolog::format_average;
///
/// assert_eq!(format_average(25.0, 3), "25.0");
/// assert_eq!(format_average(23.456_666, 3), "23.457");
/// assert_eq!(format_average(-1.5, 3), "-1.5");
/// ```
pub fn format_average(value: f64, precision: usize) -> String {
    if !value.is_finite() {
        return "0.0".to_string();
    }
    let mut text = format!("{value:.precision$}");
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').len();
        text.truncate(trimmed);
    }
    if text.ends_with('.') {
        text.push('0');
    } else if !text.contains('.') {
        text.push_str(".0");
    }

    // "-0.0" after rounding is just zero.
    if text.trim_start_matches('-').bytes().all(|b| b == b'0' || b == b'.') {
        text = text.trim_start_matches('-').to_string();
    }
    text
}

/// Cycle-driven averaging of a source series into a derived series.
#[derive(Debug, Clone)]
pub struct Rollup {
    name: String,
    config: RollupConfig,
    precision: usize,
    counter: u64,
}

impl Rollup {
    /// Creates a rollup with its cycle counter at zero.
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in log output (e.g. "hourly")
    /// * `config` - Threshold, window and derived retention
    /// * `precision` - Fractional digits kept when rendering averages
    pub fn new(name: impl Into<String>, config: RollupConfig, precision: usize) -> Self {
        Self {
            name: name.into(),
            config,
            precision,
            counter: 0,
        }
    }

    /// Label used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The rollup configuration.
    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    /// Cycles counted since the last average.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Advances the cycle counter and, when it reaches the threshold,
    /// records one average.
    ///
    /// Returns the average appended to `derived`, or `None` if the threshold
    /// was not reached this cycle. An empty window yields an average of
    /// `0.0`, which is recorded like any other value. So does a window whose
    /// sum overflows.
    pub fn tick(&mut self, source: &TimeSeries, derived: &TimeSeries) -> Option<f64> {
        self.counter += 1;
        if self.counter < self.config.every_cycles {
            return None;
        }

        let mut average = source.average(self.config.window);
        if !average.is_finite() {
            tracing::warn!(rollup = %self.name, "average overflowed ({average}), recording 0.0");
            average = 0.0;
        }
        let rendered = format_average(average, self.precision);
        derived.append(rendered.as_str());
        self.counter = 0;
        let evicted = derived.evict(self.config.retention);

        tracing::info!(
            rollup = %self.name,
            average = %rendered,
            evicted,
            "recorded average"
        );
        Some(average)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timecodec::ManualClock;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;

    fn clock() -> Arc<ManualClock> {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Arc::new(ManualClock::new(start))
    }

    fn config(every_cycles: u64) -> RollupConfig {
        RollupConfig {
            every_cycles,
            window: Duration::from_secs(60),
            retention: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_format_average() {
        assert_eq!(format_average(25.0, 3), "25.0");
        assert_eq!(format_average(20.0, 3), "20.0");
        assert_eq!(format_average(0.0, 3), "0.0");
        assert_eq!(format_average(23.45, 3), "23.45");
        assert_eq!(format_average(1.0 / 3.0, 3), "0.333");
        assert_eq!(format_average(-0.0001, 3), "0.0");
        assert_eq!(format_average(-12.27, 1), "-12.3");
        assert_eq!(format_average(7.6, 0), "8.0");
        assert_eq!(format_average(f64::INFINITY, 3), "0.0");
        assert_eq!(format_average(f64::NAN, 3), "0.0");
    }

    #[test]
    fn test_tick_fires_on_threshold() {
        let clock = clock();
        let raw = TimeSeries::with_clock("raw", clock.clone());
        let derived = TimeSeries::with_clock("derived", clock.clone());
        raw.append("10.0");
        raw.append("20.0");

        let mut rollup = Rollup::new("test", config(3), 3);
        assert_eq!(rollup.tick(&raw, &derived), None);
        assert_eq!(rollup.tick(&raw, &derived), None);
        assert_eq!(rollup.counter(), 2);
        assert_eq!(rollup.tick(&raw, &derived), Some(15.0));
        assert_eq!(rollup.counter(), 0);

        assert_eq!(derived.len(), 1);
        assert_eq!(derived.last().unwrap().payload, "15.0");
    }

    #[test]
    fn test_tick_records_zero_for_empty_window() {
        let clock = clock();
        let raw = TimeSeries::with_clock("raw", clock.clone());
        let derived = TimeSeries::with_clock("derived", clock.clone());

        let mut rollup = Rollup::new("test", config(1), 3);
        assert_eq!(rollup.tick(&raw, &derived), Some(0.0));
        assert_eq!(derived.last().unwrap().payload, "0.0");
    }

    #[test]
    fn test_tick_records_zero_for_overflowing_window() {
        let clock = clock();
        let raw = TimeSeries::with_clock("raw", clock.clone());
        let derived = TimeSeries::with_clock("derived", clock.clone());
        raw.append("1e308");
        raw.append("1e308");

        let mut rollup = Rollup::new("test", config(1), 3);
        assert_eq!(rollup.tick(&raw, &derived), Some(0.0));
        assert_eq!(derived.last().unwrap().payload, "0.0");
    }

    #[test]
    fn test_tick_evicts_derived_series() {
        let clock = clock();
        let raw = TimeSeries::with_clock("raw", clock.clone());
        let derived = TimeSeries::with_clock("derived", clock.clone());
        let mut rollup = Rollup::new("test", config(1), 3);

        rollup.tick(&raw, &derived);
        clock.advance(Duration::from_secs(300));
        rollup.tick(&raw, &derived);
        assert_eq!(derived.len(), 2);

        // The first average is now 600s old and reaches its retention.
        clock.advance(Duration::from_secs(300));
        rollup.tick(&raw, &derived);
        assert_eq!(derived.len(), 2);
    }

    #[test]
    fn test_tick_averages_only_inside_window() {
        let clock = clock();
        let raw = TimeSeries::with_clock("raw", clock.clone());
        let derived = TimeSeries::with_clock("derived", clock.clone());
        let mut rollup = Rollup::new("test", config(2), 3);

        raw.append("100.0");
        clock.advance(Duration::from_secs(120));
        raw.append("30.0");

        assert_eq!(rollup.tick(&raw, &derived), None);
        assert_eq!(rollup.tick(&raw, &derived), Some(30.0));
    }
}
