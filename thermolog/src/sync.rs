//! Periodic flush of in-memory series to append-only log files.
//!
//! Each series is paired with a [`LogFile`] and a [`FlushCursor`]. A flush
//! appends every entry newer than the cursor and then advances the cursor to
//! the newest entry written, so repeated flushes never duplicate lines and
//! the in-memory series is left untouched for averaging.
//!
//! # Design
//!
//! - The cursor is a sequence-number high-water mark (see
//!   [`TimeSeries::newest_seq`]); timestamps are not unique enough.
//! - The cursor only moves after the whole batch has been written. A failed
//!   write leaves it in place and the batch is retried on the next flush, so
//!   a partially written batch can repeat lines after an I/O error.
//! - Each scheduled flush is followed by a compaction that drops lines
//!   older than the target retention, so files stay bounded while running.
//! - Nothing here is fatal. [`DiskSync`] logs errors and moves on.
//!
//! # Restore
//!
//! On start-up [`DiskSync::restore_all`] trims every log file to its
//! retention, loads the surviving lines back into the series and marks them
//! as already flushed. Averages therefore keep their history across
//! restarts.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use thermolog::sync::{DiskSync, LogFile};
//! use thermolog::TimeSeries;
//!
//! let raw = Arc::new(TimeSeries::new("raw"));
//! let mut sync = DiskSync::new(6);
//! sync.add_target(raw.clone(), LogFile::new("log_temp.log"), Duration::from_secs(86_400));
//!
//! raw.append("23.5");
//! sync.flush_all();
//! ```

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;

use crate::error::{Result, SyncError};
use crate::series::{Entry, TimeSeries, within_window};
use crate::timecodec::TimeCodec;

/// An append-only log file holding one entry per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    path: PathBuf,
}

/// Outcome of [`LogFile::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactStats {
    /// Lines kept in the file.
    pub kept: usize,
    /// Lines removed because they expired or their timestamp did not parse.
    pub dropped: usize,
}

impl LogFile {
    /// Creates a handle for the file at `path`. Nothing is opened yet.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `entries` as lines, creating the file if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Open`] if the file cannot be opened for appending
    /// and [`SyncError::Write`] if a write fails.
    pub fn append(&self, entries: &[&Entry]) -> Result<usize> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SyncError::Open {
                path: self.path.clone(),
                source: e,
            })?;

        let write_err = |e| SyncError::Write {
            path: self.path.clone(),
            source: e,
        };
        let mut writer = BufWriter::new(file);
        for entry in entries {
            writeln!(writer, "{}", entry.to_line()).map_err(write_err)?;
        }
        writer.flush().map_err(write_err)?;

        Ok(entries.len())
    }

    fn read_lines(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Read {
                path: self.path.clone(),
                source: e,
            }
            .into()),
        }
    }

    /// Reads every parseable entry in file order.
    ///
    /// A missing file reads as empty. Lines that do not parse are logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Read`] if the file exists but cannot be read.
    pub fn read_entries(&self) -> Result<Vec<Entry>> {
        let Some(data) = self.read_lines()? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for (index, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match Entry::parse_line(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    "skipping unparseable log line: {e}"
                ),
            }
        }
        Ok(entries)
    }

    /// Rewrites the file keeping only lines younger than `max_age` at `now`.
    ///
    /// Ages come from the first 19 characters of each line (see
    /// [`TimeCodec::parse_prefix`]); lines whose prefix does not parse are
    /// dropped as well. The file is only rewritten when something was
    /// dropped. A missing file is left missing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Read`] or [`SyncError::Write`] on I/O failure.
    pub fn compact(&self, max_age: Duration, now: NaiveDateTime) -> Result<CompactStats> {
        let Some(data) = self.read_lines()? else {
            return Ok(CompactStats::default());
        };

        let mut kept = Vec::new();
        let mut dropped = 0;
        for line in data.lines() {
            match TimeCodec::parse_prefix(line) {
                Ok(ts) if within_window(now - ts, max_age) => kept.push(line),
                _ => dropped += 1,
            }
        }

        if dropped > 0 {
            let mut content = kept.join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            fs::write(&self.path, content).map_err(|e| SyncError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        }

        Ok(CompactStats {
            kept: kept.len(),
            dropped,
        })
    }
}

/// High-water mark of entries already written to a log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushCursor {
    last_flushed: Option<u64>,
}

impl FlushCursor {
    /// Creates a cursor that has flushed nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the newest entry written, if any.
    pub fn last_flushed(&self) -> Option<u64> {
        self.last_flushed
    }

    /// Marks everything up to and including `seq` as written.
    ///
    /// The cursor never moves backwards.
    pub fn advance(&mut self, seq: u64) {
        self.last_flushed = Some(self.last_flushed.map_or(seq, |last| last.max(seq)));
    }
}

/// Appends the entries of `series` newer than `cursor` to `file`.
///
/// The series lock is held for the duration of the write. Returns the number
/// of lines written.
///
/// # Errors
///
/// Returns a [`SyncError`] if the file cannot be opened or written. The
/// cursor is left unchanged in that case.
pub fn flush(series: &TimeSeries, file: &LogFile, cursor: &mut FlushCursor) -> Result<usize> {
    let (written, newest) = series.with_entries_after(cursor.last_flushed(), |entries| {
        if entries.is_empty() {
            Ok(0)
        } else {
            file.append(entries)
        }
    });
    let written = written?;

    if let Some(seq) = newest {
        cursor.advance(seq);
    }
    Ok(written)
}

/// A series, its log file and the progress of flushing one into the other.
#[derive(Debug)]
pub struct SyncTarget {
    series: Arc<TimeSeries>,
    file: LogFile,
    retention: Duration,
    cursor: FlushCursor,
}

impl SyncTarget {
    /// The series being flushed.
    pub fn series(&self) -> &Arc<TimeSeries> {
        &self.series
    }

    /// The destination file.
    pub fn file(&self) -> &LogFile {
        &self.file
    }

    /// The flush progress.
    pub fn cursor(&self) -> FlushCursor {
        self.cursor
    }

    fn flush(&mut self) -> Result<usize> {
        flush(&self.series, &self.file, &mut self.cursor)
    }

    fn restore(&mut self, now: NaiveDateTime) -> Result<Option<usize>> {
        // Restored entries are older than anything appended since start-up
        // and a second restore would load them twice.
        if self.series.newest_seq().is_some() || self.cursor.last_flushed().is_some() {
            return Ok(None);
        }

        let stats = self.file.compact(self.retention, now)?;
        if stats.dropped > 0 {
            tracing::info!(
                path = %self.file.path().display(),
                kept = stats.kept,
                dropped = stats.dropped,
                "compacted log file"
            );
        }

        let entries: Vec<Entry> = self
            .file
            .read_entries()?
            .into_iter()
            .filter(|entry| within_window(now - entry.timestamp, self.retention))
            .collect();
        let count = entries.len();

        if let Some(seq) = self.series.restore(entries) {
            self.cursor.advance(seq);
        }
        Ok(Some(count))
    }

    fn compact(&self, now: NaiveDateTime) -> Result<CompactStats> {
        self.file.compact(self.retention, now)
    }
}

/// Drives flushes of several series on a fixed cycle cadence.
#[derive(Debug)]
pub struct DiskSync {
    targets: Vec<SyncTarget>,
    every_cycles: u64,
    counter: u64,
}

impl DiskSync {
    /// Creates a disk sync that flushes every `every_cycles` ticks.
    ///
    /// A cadence of zero is treated as one.
    pub fn new(every_cycles: u64) -> Self {
        Self {
            targets: Vec::new(),
            every_cycles: every_cycles.max(1),
            counter: 0,
        }
    }

    /// Registers a series to be flushed into `file`.
    ///
    /// `retention` is only used by [`DiskSync::restore_all`].
    pub fn add_target(&mut self, series: Arc<TimeSeries>, file: LogFile, retention: Duration) {
        self.targets.push(SyncTarget {
            series,
            file,
            retention,
            cursor: FlushCursor::new(),
        });
    }

    /// The registered targets in registration order.
    pub fn targets(&self) -> &[SyncTarget] {
        &self.targets
    }

    /// Compacts each log file and reloads its recent entries into the
    /// (still empty) series, marking them as flushed.
    ///
    /// A target whose series already holds entries, or that has already
    /// flushed or restored, is skipped with a warning. Failures are logged
    /// and leave that series empty. Returns the number of entries restored
    /// across all targets.
    pub fn restore_all(&mut self, now: NaiveDateTime) -> usize {
        let mut total = 0;
        for target in &mut self.targets {
            match target.restore(now) {
                Ok(None) => tracing::warn!(
                    series = target.series.name(),
                    "series already in use, skipping restore"
                ),
                Ok(Some(count)) => {
                    tracing::info!(
                        series = target.series.name(),
                        restored = count,
                        "restored entries from disk"
                    );
                    total += count;
                }
                Err(e) => tracing::warn!(
                    series = target.series.name(),
                    "failed to restore from disk: {e}"
                ),
            }
        }
        total
    }

    /// Counts one cycle and, when the cadence is due, flushes every target
    /// and trims its file to the target retention at `now`.
    ///
    /// Returns true if a flush ran this cycle.
    pub fn tick(&mut self, now: NaiveDateTime) -> bool {
        self.counter += 1;
        if self.counter < self.every_cycles {
            return false;
        }
        self.counter = 0;
        self.flush_all();
        self.compact_all(now);
        true
    }

    /// Drops lines older than each target's retention from its file.
    ///
    /// Only whole expired lines are removed, so flush cursors stay valid.
    /// Errors are logged, never returned. Returns the number of lines
    /// dropped across all targets.
    pub fn compact_all(&mut self, now: NaiveDateTime) -> usize {
        let mut total = 0;
        for target in &self.targets {
            match target.compact(now) {
                Ok(stats) => total += stats.dropped,
                Err(e) => tracing::warn!(
                    series = target.series.name(),
                    "compaction skipped: {e}"
                ),
            }
        }
        if total > 0 {
            tracing::debug!(lines = total, "trimmed expired lines from log files");
        }
        total
    }

    /// Flushes every target now. Errors are logged, never returned.
    ///
    /// Returns the number of lines written across all targets.
    pub fn flush_all(&mut self) -> usize {
        let mut total = 0;
        for target in &mut self.targets {
            match target.flush() {
                Ok(written) => total += written,
                Err(e) => tracing::warn!(
                    series = target.series.name(),
                    "flush skipped: {e}"
                ),
            }
        }
        if total > 0 {
            tracing::debug!(lines = total, "flushed series to disk");
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timecodec::ManualClock;
    use chrono::{NaiveDate, TimeDelta};
    use tempfile::tempdir;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_milli_opt(12, 0, 0, 250)
            .unwrap()
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_flush_cursor_never_moves_back() {
        let mut cursor = FlushCursor::new();
        assert_eq!(cursor.last_flushed(), None);
        cursor.advance(5);
        cursor.advance(3);
        assert_eq!(cursor.last_flushed(), Some(5));
    }

    #[test]
    fn test_append_writes_line_format() {
        let dir = tempdir().unwrap();
        let file = LogFile::new(dir.path().join("log_temp.log"));
        let entry = Entry::new(start(), "23.5");

        assert_eq!(file.append(&[&entry]).unwrap(), 1);
        assert_eq!(file.append(&[&entry]).unwrap(), 1);
        assert_eq!(
            fs::read_to_string(file.path()).unwrap(),
            "2024-6-1 12:0:0.250: 23.5\n2024-6-1 12:0:0.250: 23.5\n"
        );
    }

    #[test]
    fn test_append_to_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let file = LogFile::new(dir.path().join("missing").join("log.log"));
        let entry = Entry::new(start(), "1.0");
        assert!(matches!(
            file.append(&[&entry]),
            Err(crate::ThermologError::Sync(SyncError::Open { .. }))
        ));
    }

    #[test]
    fn test_flush_writes_each_entry_once() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let series = TimeSeries::with_clock("raw", clock.clone());
        let file = LogFile::new(dir.path().join("raw.log"));
        let mut cursor = FlushCursor::new();

        series.append("1.0");
        series.append("2.0");
        assert_eq!(flush(&series, &file, &mut cursor).unwrap(), 2);
        assert_eq!(flush(&series, &file, &mut cursor).unwrap(), 0);

        series.append("3.0");
        assert_eq!(flush(&series, &file, &mut cursor).unwrap(), 1);
        assert_eq!(cursor.last_flushed(), Some(2));

        let written = lines(file.path());
        assert_eq!(written.len(), 3);
        assert!(written[2].ends_with(": 3.0"));
        // Flushing leaves the in-memory series intact.
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn test_flush_failure_keeps_cursor() {
        let dir = tempdir().unwrap();
        let series = TimeSeries::new("raw");
        let file = LogFile::new(dir.path().join("nope").join("raw.log"));
        let mut cursor = FlushCursor::new();

        series.append("1.0");
        assert!(flush(&series, &file, &mut cursor).is_err());
        assert_eq!(cursor.last_flushed(), None);

        fs::create_dir(dir.path().join("nope")).unwrap();
        assert_eq!(flush(&series, &file, &mut cursor).unwrap(), 1);
        assert_eq!(cursor.last_flushed(), Some(0));
    }

    #[test]
    fn test_read_entries_skips_bad_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.log");
        fs::write(
            &path,
            "2024-6-1 12:0:0.250: 23.5\ngarbage\n\n2024-6-1 12:0:1.0: 24.0\n",
        )
        .unwrap();

        let entries = LogFile::new(&path).read_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], Entry::new(start(), "23.5"));
        assert_eq!(entries[1].payload, "24.0");
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let file = LogFile::new(dir.path().join("absent.log"));
        assert!(file.read_entries().unwrap().is_empty());
        assert_eq!(
            file.compact(Duration::from_secs(1), start()).unwrap(),
            CompactStats::default()
        );
        assert!(!file.path().exists());
    }

    #[test]
    fn test_compact_drops_old_and_unparseable_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.log");
        let old = Entry::new(start() - TimeDelta::hours(2), "10.0");
        let recent = Entry::new(start() - TimeDelta::minutes(5), "20.0");
        fs::write(
            &path,
            format!("{}\nshort\n{}\n", old.to_line(), recent.to_line()),
        )
        .unwrap();

        let file = LogFile::new(&path);
        let stats = file.compact(Duration::from_secs(3600), start()).unwrap();
        assert_eq!(stats, CompactStats { kept: 1, dropped: 2 });
        assert_eq!(lines(&path), vec![recent.to_line()]);
    }

    #[test]
    fn test_disk_sync_cadence() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let series = Arc::new(TimeSeries::with_clock("raw", clock.clone()));
        let mut sync = DiskSync::new(3);
        sync.add_target(
            series.clone(),
            LogFile::new(dir.path().join("raw.log")),
            Duration::from_secs(60),
        );

        series.append("1.0");
        assert!(!sync.tick(start()));
        assert!(!sync.tick(start()));
        assert!(!dir.path().join("raw.log").exists());
        assert!(sync.tick(start()));
        assert_eq!(lines(&dir.path().join("raw.log")).len(), 1);
        assert_eq!(sync.targets()[0].cursor().last_flushed(), Some(0));
    }

    #[test]
    fn test_restore_all_marks_entries_flushed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.log");
        let expired = Entry::new(start() - TimeDelta::hours(30), "5.0");
        let kept = Entry::new(start() - TimeDelta::hours(1), "21.5");
        fs::write(&path, format!("{}\n{}\n", expired.to_line(), kept.to_line())).unwrap();

        let clock = Arc::new(ManualClock::new(start()));
        let series = Arc::new(TimeSeries::with_clock("raw", clock.clone()));
        let mut sync = DiskSync::new(1);
        sync.add_target(series.clone(), LogFile::new(&path), Duration::from_secs(86_400));

        assert_eq!(sync.restore_all(start()), 1);
        assert_eq!(series.entries(), vec![kept.clone()]);
        assert_eq!(lines(&path), vec![kept.to_line()]);

        // Restored lines are not written again.
        assert_eq!(sync.flush_all(), 0);
        series.append("22.0");
        assert_eq!(sync.flush_all(), 1);
        assert_eq!(lines(&path).len(), 2);
    }

    #[test]
    fn test_restore_skips_series_already_in_use() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.log");
        let old = Entry::new(start() - TimeDelta::minutes(5), "10.0");
        fs::write(&path, format!("{}\n", old.to_line())).unwrap();

        let clock = Arc::new(ManualClock::new(start()));
        let series = Arc::new(TimeSeries::with_clock("raw", clock.clone()));
        let mut sync = DiskSync::new(1);
        sync.add_target(series.clone(), LogFile::new(&path), Duration::from_secs(86_400));

        series.append("99.0");
        assert_eq!(sync.restore_all(start()), 0);
        assert_eq!(series.len(), 1);

        // The live entry still reaches disk after the skipped restore.
        assert_eq!(sync.flush_all(), 1);
        let written = lines(&path);
        assert_eq!(written.len(), 2);
        assert!(written[1].ends_with(": 99.0"));
    }

    #[test]
    fn test_restore_runs_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.log");
        let old = Entry::new(start() - TimeDelta::minutes(5), "10.0");
        fs::write(&path, format!("{}\n", old.to_line())).unwrap();

        let clock = Arc::new(ManualClock::new(start()));
        let series = Arc::new(TimeSeries::with_clock("raw", clock.clone()));
        let mut sync = DiskSync::new(1);
        sync.add_target(series.clone(), LogFile::new(&path), Duration::from_secs(86_400));

        assert_eq!(sync.restore_all(start()), 1);
        assert_eq!(sync.restore_all(start()), 0);
        assert_eq!(series.entries(), vec![old]);
    }

    #[test]
    fn test_tick_trims_expired_lines() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let series = Arc::new(TimeSeries::with_clock("raw", clock.clone()));
        let path = dir.path().join("raw.log");
        let mut sync = DiskSync::new(1);
        sync.add_target(series.clone(), LogFile::new(&path), Duration::from_secs(60));

        series.append("1.0");
        assert!(sync.tick(start()));
        clock.advance(Duration::from_secs(90));
        series.append("2.0");
        assert!(sync.tick(start() + TimeDelta::seconds(90)));

        let written = lines(&path);
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with(": 2.0"));
        assert_eq!(sync.compact_all(start() + TimeDelta::seconds(90)), 0);
    }
}
