//! Error types for the thermolog sensor logger.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all thermolog operations.
///
/// Only configuration and device-open failures are fatal to the CLI. Every
/// other variant is recoverable: the ingest loop logs it and carries on with
/// the next cycle.
#[derive(Error, Debug)]
pub enum ThermologError {
    /// A log-line timestamp could not be parsed.
    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    /// The configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The serial device failed to open or read.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// A log file could not be read or written.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Errors produced by the timestamp codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// Fewer characters than the fixed prefix width were available.
    #[error("timestamp prefix needs {required} characters, got {len}")]
    TooShort {
        /// Number of characters available.
        len: usize,
        /// Number of characters required.
        required: usize,
    },

    /// The numeric fields did not scan cleanly.
    #[error("malformed timestamp '{text}': {reason}")]
    Malformed {
        /// The offending text.
        text: String,
        /// What the scanner expected.
        reason: String,
    },

    /// The fields scanned but do not form a valid calendar date or time.
    #[error("timestamp '{text}' is not a valid date/time")]
    OutOfRange {
        /// The offending text.
        text: String,
    },
}

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Load {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::MonitorConfig`].
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A field holds a value the monitor cannot run with.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of the problem.
        reason: String,
    },
}

/// Errors raised by the device collaborator.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The serial port could not be opened.
    #[cfg(feature = "serial")]
    #[error("failed to open port '{port}': {source}")]
    Open {
        /// The port address.
        port: String,
        /// The underlying serialport error.
        #[source]
        source: serialport::Error,
    },

    /// Changing the read timeout failed.
    #[cfg(feature = "serial")]
    #[error("failed to set read timeout on '{port}': {source}")]
    Timeout {
        /// The port address.
        port: String,
        /// The underlying serialport error.
        #[source]
        source: serialport::Error,
    },

    /// A read failed for a reason other than a timeout.
    #[error("read from '{port}' failed: {source}")]
    Read {
        /// The port address.
        port: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The device has been closed or disconnected.
    #[error("device '{port}' is closed")]
    Closed {
        /// The port address.
        port: String,
    },
}

/// Errors that can occur while moving entries between memory and log files.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The log file could not be opened.
    #[error("failed to open log file '{}': {source}", path.display())]
    Open {
        /// The log file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing to the log file failed.
    #[error("failed to write log file '{}': {source}", path.display())]
    Write {
        /// The log file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading the log file failed.
    #[error("failed to read log file '{}': {source}", path.display())]
    Read {
        /// The log file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Type alias for `Result<T, ThermologError>`.
pub type Result<T> = std::result::Result<T, ThermologError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_error_wraps_into_top_level() {
        let err: ThermologError = TimestampError::TooShort {
            len: 4,
            required: 19,
        }
        .into();
        assert!(matches!(err, ThermologError::Timestamp(_)));
        assert_eq!(
            err.to_string(),
            "timestamp error: timestamp prefix needs 19 characters, got 4"
        );
    }

    #[test]
    fn test_sync_error_display_includes_path() {
        let err = SyncError::Open {
            path: PathBuf::from("/nowhere/log_temp.log"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/nowhere/log_temp.log"));
    }
}
