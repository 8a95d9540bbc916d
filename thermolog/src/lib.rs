//! # thermolog
//!
//! Serial sensor logger with rolling in-memory windows and periodic averages.
//!
//! thermolog polls a serial device for numeric readings, validates and
//! timestamps them, keeps a rolling 24 hour window in memory, computes
//! hourly and daily averages on a cycle cadence and appends everything to
//! flat log files.
//!
//! ## Key Properties
//!
//! - One exclusive lock per series; distinct series never block each other
//! - Head-only, age-based eviction that costs O(expired entries)
//! - Exactly-once flushes through a per-file high-water mark
//! - Log lines stay in the fixed `Y-M-D H:M:S.ms: payload` format
//! - Nothing after start-up is fatal; errors are logged and the loop goes on
//!
//! ## Quick Start
//!
//! ```rust
//! use thermolog::{IngestLoop, MonitorConfig, ScriptedDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let config = MonitorConfig {
//!     log_dir: dir.path().to_path_buf(),
//!     ..MonitorConfig::default()
//! };
//!
//! // With the `serial` feature, `SerialDevice::open(port, baud)` reads a
//! // real sensor instead.
//! let mut device = ScriptedDevice::new(["21.5", "22.0", "22.5"]);
//! let mut ingest = IngestLoop::new(config)?;
//! ingest.restore();
//! for _ in 0..3 {
//!     ingest.run_cycle(&mut device);
//! }
//! ingest.flush();
//!
//! assert_eq!(ingest.raw().len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`TimeCodec`]: Formats and parses the log-line timestamp
//! - [`TimeSeries`]: Bounded, time-ordered series of [`Entry`] values
//! - [`Rollup`]: Cycle-driven averages into a derived series
//! - [`DiskSync`]: Periodic, exactly-once flush to log files
//! - [`IngestLoop`]: Reads, validates and routes one token per cycle
//!
//! ## Features
//!
//! - `serial`: enables `SerialDevice` on top of the `serialport` crate

pub mod aggregate;
pub mod config;
pub mod device;
pub mod error;
pub mod ingest;
pub mod series;
pub mod sync;
pub mod timecodec;

// Re-export primary API types at crate root for convenience.
pub use aggregate::{Rollup, format_average};
pub use config::{MonitorConfig, RollupConfig};
#[cfg(feature = "serial")]
pub use device::SerialDevice;
pub use device::{Device, ScriptedDevice, TokenFramer};
pub use error::{Result, ThermologError};
pub use ingest::{CycleReport, IngestLoop, Reading, is_valid_reading};
pub use series::{Entry, TimeSeries};
pub use sync::{DiskSync, FlushCursor, LogFile};
pub use timecodec::{Clock, ManualClock, SystemClock, TimeCodec};
