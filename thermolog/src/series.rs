//! Bounded, time-ordered in-memory series.
//!
//! A [`TimeSeries`] is an append-only log of [`Entry`] values kept
//! oldest-first. Entries are stamped with the series clock when appended,
//! so insertion order is time order. Old entries leave from the head only,
//! through [`TimeSeries::evict`].
//!
//! # Locking
//!
//! Every operation on a series takes the same mutex, so appends, evictions,
//! averages and flush reads on one series never interleave. Distinct series
//! have distinct locks and never block each other.
//!
//! # Sequence numbers
//!
//! Each appended entry also receives a sequence number that increases by one
//! per append and is never reused. Disk sync uses it as a high-water mark to
//! write every entry exactly once.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};

use crate::error::TimestampError;
use crate::timecodec::{Clock, SystemClock, TimeCodec};

/// Separator between the timestamp and the payload in a log line.
pub const LINE_SEPARATOR: &str = ": ";

/// One timestamped payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Local civil time at which the entry was appended.
    pub timestamp: NaiveDateTime,
    /// The raw payload, e.g. a validated reading or a rendered average.
    pub payload: String,
}

impl Entry {
    /// Creates an entry from its parts.
    pub fn new(timestamp: NaiveDateTime, payload: impl Into<String>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }

    /// Renders the entry as a log line, without the trailing newline.
    ///
    /// ```rust
    /// use chrono::NaiveDate;
    /// use thermolog::Entry;
    ///
    /// let ts = NaiveDate::from_ymd_opt(2024, 3, 5)
    ///     .and_then(|d| d.and_hms_milli_opt(9, 2, 1, 7))
    ///     .unwrap();
    /// assert_eq!(Entry::new(ts, "23.5").to_line(), "2024-3-5 9:2:1.7: 23.5");
    /// ```
    pub fn to_line(&self) -> String {
        format!(
            "{}{LINE_SEPARATOR}{}",
            TimeCodec::format(&self.timestamp),
            self.payload
        )
    }

    /// Parses a log line produced by [`Entry::to_line`].
    ///
    /// The timestamp ends at the first `": "`; everything after it is the
    /// payload, colons included.
    ///
    /// # Errors
    ///
    /// Returns a [`TimestampError`] if the separator is missing or the
    /// timestamp does not parse.
    pub fn parse_line(line: &str) -> Result<Self, TimestampError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (stamp, payload) =
            line.split_once(LINE_SEPARATOR)
                .ok_or_else(|| TimestampError::Malformed {
                    text: line.to_string(),
                    reason: format!("missing '{LINE_SEPARATOR}' separator"),
                })?;
        Ok(Self::new(TimeCodec::parse(stamp)?, payload))
    }

    /// Parses the payload as a finite number, ignoring surrounding spaces.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the payload is not a finite
    /// decimal number.
    pub fn value(&self) -> Result<f64, String> {
        let text = self.payload.trim_matches(' ');
        match text.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            Ok(v) => Err(format!("'{text}' is not finite ({v})")),
            Err(e) => Err(format!("'{text}': {e}")),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Returns true while an entry of age `age` is still inside `window`.
///
/// Windows too large for a [`TimeDelta`] (e.g. `Duration::MAX`) never close.
pub(crate) fn within_window(age: TimeDelta, window: Duration) -> bool {
    match TimeDelta::from_std(window) {
        Ok(window) => age < window,
        Err(_) => true,
    }
}

#[derive(Debug)]
struct Stamped {
    seq: u64,
    entry: Entry,
}

#[derive(Debug, Default)]
struct SeriesState {
    entries: VecDeque<Stamped>,
    next_seq: u64,
}

impl SeriesState {
    fn push(&mut self, entry: Entry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(Stamped { seq, entry });
        seq
    }
}

/// An append-only, time-ordered log of entries with window-based eviction
/// and averaging.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use thermolog::TimeSeries;
///
/// let series = TimeSeries::new("raw");
/// series.append("10.0");
/// series.append("20.0");
/// series.append("30.0");
///
/// assert_eq!(series.average(Duration::from_secs(3600)), 20.0);
/// assert_eq!(series.evict(Duration::from_secs(3600)), 0);
/// assert_eq!(series.len(), 3);
/// ```
pub struct TimeSeries {
    name: String,
    clock: Arc<dyn Clock>,
    state: Mutex<SeriesState>,
}

impl fmt::Debug for TimeSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSeries")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl TimeSeries {
    /// Creates an empty series stamped by the local wall clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    /// Creates an empty series stamped by `clock`.
    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            state: Mutex::new(SeriesState::default()),
        }
    }

    /// Human-readable name used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, SeriesState> {
        // A panic mid-operation cannot leave the deque half-updated, so a
        // poisoned lock is still safe to use.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `payload` at the tail, stamped with the current time.
    ///
    /// The payload is stored as given; validation is the caller's job.
    /// Returns the sequence number assigned to the new entry.
    pub fn append(&self, payload: impl Into<String>) -> u64 {
        let entry = Entry::new(self.clock.now(), payload);
        self.lock().push(entry)
    }

    /// Appends previously persisted entries in the order given, keeping
    /// their original timestamps.
    ///
    /// Returns the sequence number of the last restored entry, if any.
    pub fn restore(&self, entries: impl IntoIterator<Item = Entry>) -> Option<u64> {
        let mut state = self.lock();
        entries.into_iter().map(|entry| state.push(entry)).last()
    }

    /// Removes entries from the head whose age is at least `max_age`.
    ///
    /// Scanning stops at the first entry that is still young enough, so the
    /// cost is proportional to the number of expired entries. Calling it
    /// twice in a row without an intervening append has no further effect.
    ///
    /// Returns the number of entries removed.
    pub fn evict(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();

        let mut removed = 0;
        while let Some(front) = state.entries.front() {
            if within_window(now - front.entry.timestamp, max_age) {
                break;
            }
            state.entries.pop_front();
            removed += 1;
        }

        if removed > 0 {
            tracing::debug!(series = %self.name, removed, "evicted expired entries");
        }
        removed
    }

    /// Mean of every entry younger than `window` whose payload is numeric.
    ///
    /// The whole series is scanned. Payloads that do not parse are logged
    /// and skipped. Returns `0.0` when nothing qualifies.
    #[allow(clippy::cast_precision_loss)] // Entry counts stay far below 2^52
    pub fn average(&self, window: Duration) -> f64 {
        let now = self.clock.now();
        let state = self.lock();

        let mut sum = 0.0;
        let mut count = 0usize;
        for stamped in &state.entries {
            let entry = &stamped.entry;
            if !within_window(now - entry.timestamp, window) {
                continue;
            }
            match entry.value() {
                Ok(v) => {
                    sum += v;
                    count += 1;
                }
                Err(reason) => {
                    tracing::warn!(series = %self.name, "failed to parse reading {reason}");
                }
            }
        }

        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if the series holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// The newest entry, if any.
    pub fn last(&self) -> Option<Entry> {
        self.lock().entries.back().map(|s| s.entry.clone())
    }

    /// A copy of every entry, oldest first.
    pub fn entries(&self) -> Vec<Entry> {
        self.lock().entries.iter().map(|s| s.entry.clone()).collect()
    }

    /// Sequence number of the newest entry ever appended, if any.
    ///
    /// Unlike [`TimeSeries::last`] this survives eviction.
    pub fn newest_seq(&self) -> Option<u64> {
        self.lock().next_seq.checked_sub(1)
    }

    /// Runs `f` under the series lock over the entries whose sequence number
    /// is greater than `after` (all entries when `after` is `None`).
    ///
    /// Returns the closure result and the sequence number of the newest entry
    /// passed to it, or `None` if there were no such entries.
    pub fn with_entries_after<R>(
        &self,
        after: Option<u64>,
        f: impl FnOnce(&[&Entry]) -> R,
    ) -> (R, Option<u64>) {
        let state = self.lock();
        let pending: Vec<&Stamped> = state
            .entries
            .iter()
            .filter(|s| after.is_none_or(|seq| s.seq > seq))
            .collect();

        let newest = pending.last().map(|s| s.seq);
        let entries: Vec<&Entry> = pending.iter().map(|s| &s.entry).collect();
        (f(&entries), newest)
    }
}
