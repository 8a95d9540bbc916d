//! Timestamp codec and clock sources.
//!
//! Every log line starts with a local civil timestamp rendered as
//! `YYYY-M-D H:M:S.mmm`. Only the year has a fixed width; month, day, hour,
//! minute, second and millisecond are printed without zero padding, so
//! `2024-3-5 9:2:1.7` is a valid timestamp (7 ms past 09:02:01).
//!
//! # Precision
//!
//! - [`TimeCodec::format`] followed by [`TimeCodec::parse`] round-trips at
//!   millisecond precision.
//! - [`TimeCodec::parse_prefix`] reads only the first
//!   [`PREFIX_LEN`] characters of a line and therefore keeps second
//!   precision. It is the lenient scanner used to age lines on disk.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::format::ParseErrorKind;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, TimeDelta, Timelike};

use crate::error::TimestampError;

/// Width of the timestamp prefix inspected by [`TimeCodec::parse_prefix`].
pub const PREFIX_LEN: usize = 19;

/// chrono accepts unpadded numeric fields when parsing with this format.
const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formatter and parser for the log-line timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeCodec;

impl TimeCodec {
    /// Renders `ts` as `Y-M-D H:M:S.ms` without zero padding.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chrono::NaiveDate;
    /// use thermolog::TimeCodec;
    ///
    /// let ts = NaiveDate::from_ymd_opt(2024, 3, 5)
    ///     .and_then(|d| d.and_hms_milli_opt(9, 2, 1, 7))
    ///     .unwrap();
    /// assert_eq!(TimeCodec::format(&ts), "2024-3-5 9:2:1.7");
    /// ```
    pub fn format(ts: &NaiveDateTime) -> String {
        // Leap seconds report nanos >= 1e9; clamp so the field stays < 1000.
        let millis = (ts.nanosecond() / 1_000_000).min(999);
        format!(
            "{}-{}-{} {}:{}:{}.{}",
            ts.year(),
            ts.month(),
            ts.day(),
            ts.hour(),
            ts.minute(),
            ts.second(),
            millis
        )
    }

    /// Parses a complete timestamp as produced by [`TimeCodec::format`].
    ///
    /// The millisecond field is optional. Surrounding whitespace is ignored,
    /// anything else after the timestamp is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::Malformed`] if the fields do not scan and
    /// [`TimestampError::OutOfRange`] if they do not form a valid date/time.
    pub fn parse(text: &str) -> Result<NaiveDateTime, TimestampError> {
        let text = text.trim();
        let malformed = |reason: String| TimestampError::Malformed {
            text: text.to_string(),
            reason,
        };
        let out_of_range = || TimestampError::OutOfRange {
            text: text.to_string(),
        };

        // "%3f" wants exactly three digits, but "1.7" means 7 ms.
        let (head, millis) = match text.split_once('.') {
            Some((head, millis)) => (head, Some(millis)),
            None => (text, None),
        };

        let ts = NaiveDateTime::parse_from_str(head, STAMP_FORMAT).map_err(|e| {
            match e.kind() {
                ParseErrorKind::OutOfRange | ParseErrorKind::Impossible => out_of_range(),
                _ => malformed(e.to_string()),
            }
        })?;

        let Some(millis) = millis else {
            return Ok(ts);
        };
        if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed(format!("invalid millisecond field '{millis}'")));
        }
        let millis: u32 = millis.parse().map_err(|_| out_of_range())?;
        if millis >= 1000 {
            return Err(out_of_range());
        }
        ts.with_nanosecond(millis * 1_000_000).ok_or_else(out_of_range)
    }

    /// Parses the timestamp at the start of a log line from its first
    /// [`PREFIX_LEN`] characters.
    ///
    /// Any single non-whitespace character is accepted as a field
    /// delimiter and whatever follows the seconds field is ignored, so the
    /// result has second precision.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::TooShort`] if the line has fewer than
    /// [`PREFIX_LEN`] characters, otherwise the same errors as
    /// [`TimeCodec::parse`].
    pub fn parse_prefix(line: &str) -> Result<NaiveDateTime, TimestampError> {
        let len = line.chars().count();
        if len < PREFIX_LEN {
            return Err(TimestampError::TooShort {
                len,
                required: PREFIX_LEN,
            });
        }

        let end = line
            .char_indices()
            .nth(PREFIX_LEN)
            .map_or(line.len(), |(idx, _)| idx);
        let prefix = &line[..end];

        Scanner::new(prefix).civil_fields()?.into_datetime(prefix)
    }
}

/// Source of "now" for series and the ingest loop.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current local civil time.
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock in the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward. Advances that would overflow are ignored.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = TimeDelta::from_std(by)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
        {
            *now = next;
        }
    }

    /// Jumps to an arbitrary instant, including backwards.
    pub fn set(&self, to: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Year through second, before calendar validation.
struct CivilFields {
    year: i64,
    month: i64,
    day: i64,
    hour: i64,
    minute: i64,
    second: i64,
}

impl CivilFields {
    fn into_datetime(self, text: &str) -> Result<NaiveDateTime, TimestampError> {
        let out_of_range = || TimestampError::OutOfRange {
            text: text.to_string(),
        };
        let year = i32::try_from(self.year).map_err(|_| out_of_range())?;
        let field = |v: i64| u32::try_from(v).map_err(|_| out_of_range());

        NaiveDate::from_ymd_opt(year, field(self.month)?, field(self.day)?)
            .and_then(|date| {
                date.and_hms_opt(
                    field(self.hour).ok()?,
                    field(self.minute).ok()?,
                    field(self.second).ok()?,
                )
            })
            .ok_or_else(out_of_range)
    }
}

/// Lenient cursor over a line prefix: numbers separated by any single
/// delimiter character.
struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn malformed(&self, reason: impl Into<String>) -> TimestampError {
        TimestampError::Malformed {
            text: self.text.to_string(),
            reason: reason.into(),
        }
    }

    /// Reads an optionally signed decimal integer after optional whitespace.
    fn number(&mut self, field: &str) -> Result<i64, TimestampError> {
        self.skip_whitespace();
        let rest = self.rest();
        let sign_len = usize::from(rest.starts_with(['-', '+']));
        let digits = rest[sign_len..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if digits == 0 {
            return Err(self.malformed(format!("expected {field}")));
        }

        let token = &rest[..sign_len + digits];
        let value = token
            .parse::<i64>()
            .map_err(|_| self.malformed(format!("{field} out of range")))?;
        self.pos += token.len();
        Ok(value)
    }

    fn delimiter(&mut self) -> Result<(), TimestampError> {
        self.skip_whitespace();
        match self.rest().chars().next() {
            Some(c) => {
                self.pos += c.len_utf8();
                Ok(())
            }
            None => Err(self.malformed("expected delimiter")),
        }
    }

    fn civil_fields(&mut self) -> Result<CivilFields, TimestampError> {
        let year = self.number("year")?;
        self.delimiter()?;
        let month = self.number("month")?;
        self.delimiter()?;
        let day = self.number("day")?;
        let hour = self.number("hour")?;
        self.delimiter()?;
        let minute = self.number("minute")?;
        self.delimiter()?;
        let second = self.number("second")?;

        Ok(CivilFields {
            year,
            month,
            day,
            hour,
            minute,
            second,
        })
    }
}
