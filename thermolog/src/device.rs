//! Device collaborators that produce one token per read.
//!
//! The ingest loop only needs [`Device::read_token`], which blocks for at
//! most the device's read timeout and returns either one token or an empty
//! string. Framing, baud rate and port handling stay behind the trait.
//!
//! - [`SerialDevice`] reads whitespace-delimited tokens from a serial port
//!   (requires the `serial` feature).
//! - [`ScriptedDevice`] replays a fixed list of tokens.

use std::collections::VecDeque;

use crate::error::{DeviceError, Result};

/// Longest token kept before it is cut off and emitted as-is.
pub const MAX_TOKEN_LEN: usize = 256;

/// A source of sensor tokens.
pub trait Device {
    /// Reads one token, blocking up to the read timeout.
    ///
    /// Returns an empty string when nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns a [`DeviceError`] if the device is closed or the read fails
    /// for a reason other than a timeout.
    fn read_token(&mut self) -> Result<String>;

    /// Returns true while the device can still be read.
    fn is_open(&self) -> bool;
}

/// Splits a byte stream into whitespace-delimited tokens.
///
/// A token is complete once a whitespace byte follows it, so a token split
/// across two reads is reassembled. Bytes are decoded lossily; anything that
/// is not valid UTF-8 ends up as replacement characters and fails reading
/// validation downstream.
#[derive(Debug, Default)]
pub struct TokenFramer {
    partial: Vec<u8>,
    ready: VecDeque<String>,
}

impl TokenFramer {
    /// Creates an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte.is_ascii_whitespace() {
                self.finish_token();
            } else {
                self.partial.push(byte);
                if self.partial.len() >= MAX_TOKEN_LEN {
                    self.finish_token();
                }
            }
        }
    }

    fn finish_token(&mut self) {
        if !self.partial.is_empty() {
            let token = String::from_utf8_lossy(&self.partial).into_owned();
            self.ready.push_back(token);
            self.partial.clear();
        }
    }

    /// Takes the oldest complete token, if any.
    pub fn next_token(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Bytes of an unfinished token still waiting for a delimiter.
    pub fn pending_bytes(&self) -> usize {
        self.partial.len()
    }
}

/// A device that replays a fixed sequence of tokens, then reads empty.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevice {
    tokens: VecDeque<String>,
    open: bool,
}

impl ScriptedDevice {
    /// Creates an open device that will return `tokens` in order.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            open: true,
        }
    }

    /// Queues one more token.
    pub fn push(&mut self, token: impl Into<String>) {
        self.tokens.push_back(token.into());
    }

    /// Tokens not read yet.
    pub fn remaining(&self) -> usize {
        self.tokens.len()
    }

    /// Closes the device; further reads fail.
    pub fn close(&mut self) {
        self.open = false;
    }
}

impl Device for ScriptedDevice {
    fn read_token(&mut self) -> Result<String> {
        if !self.open {
            return Err(DeviceError::Closed {
                port: "scripted".to_string(),
            }
            .into());
        }
        Ok(self.tokens.pop_front().unwrap_or_default())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(feature = "serial")]
pub use serial::SerialDevice;

#[cfg(feature = "serial")]
mod serial {
    use std::io::{ErrorKind, Read};
    use std::time::{Duration, Instant};

    use serialport::SerialPort;

    use super::{Device, TokenFramer};
    use crate::error::{DeviceError, Result};

    /// Default read timeout applied when a port is opened.
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// A serial port read as whitespace-delimited tokens.
    pub struct SerialDevice {
        address: String,
        port: Box<dyn SerialPort>,
        timeout: Duration,
        framer: TokenFramer,
        open: bool,
    }

    impl std::fmt::Debug for SerialDevice {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SerialDevice")
                .field("address", &self.address)
                .field("timeout", &self.timeout)
                .field("open", &self.open)
                .finish_non_exhaustive()
        }
    }

    impl SerialDevice {
        /// Opens `address` (e.g. `/dev/ttyUSB0` or `COM3`) at `baud_rate`.
        ///
        /// # Errors
        ///
        /// Returns [`DeviceError::Open`] if the port cannot be opened.
        pub fn open(address: &str, baud_rate: u32) -> Result<Self> {
            let port = serialport::new(address, baud_rate)
                .timeout(DEFAULT_TIMEOUT)
                .open()
                .map_err(|e| DeviceError::Open {
                    port: address.to_string(),
                    source: e,
                })?;

            tracing::info!(port = address, baud_rate, "opened serial port");
            Ok(Self {
                address: address.to_string(),
                port,
                timeout: DEFAULT_TIMEOUT,
                framer: TokenFramer::new(),
                open: true,
            })
        }

        /// The port address.
        pub fn address(&self) -> &str {
            &self.address
        }

        /// Sets how long [`Device::read_token`] may block.
        ///
        /// # Errors
        ///
        /// Returns [`DeviceError::Timeout`] if the driver rejects the value.
        pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.port
                .set_timeout(timeout)
                .map_err(|e| DeviceError::Timeout {
                    port: self.address.clone(),
                    source: e,
                })?;
            self.timeout = timeout;
            Ok(())
        }
    }

    impl Device for SerialDevice {
        fn read_token(&mut self) -> Result<String> {
            if !self.open {
                return Err(DeviceError::Closed {
                    port: self.address.clone(),
                }
                .into());
            }

            let deadline = Instant::now() + self.timeout;
            let mut buf = [0u8; 256];
            loop {
                if let Some(token) = self.framer.next_token() {
                    return Ok(token);
                }
                if Instant::now() >= deadline {
                    return Ok(String::new());
                }

                match self.port.read(&mut buf) {
                    Ok(0) => return Ok(String::new()),
                    Ok(n) => self.framer.push(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(String::new()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        if matches!(
                            e.kind(),
                            ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof
                        ) {
                            self.open = false;
                        }
                        return Err(DeviceError::Read {
                            port: self.address.clone(),
                            source: e,
                        }
                        .into());
                    }
                }
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }
}
