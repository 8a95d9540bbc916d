//! CLI that polls a serial temperature sensor into thermolog series.
//!
//! Reads one token per cycle from the given port, keeps a rolling day of
//! readings plus hourly and daily averages, and flushes them to log files.
//!
//! Exit codes: `-1` for missing or invalid arguments, `-2` when the port
//! cannot be opened, `-3` for an invalid configuration.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use clap::error::ErrorKind;
use thermolog::{Device, IngestLoop, MonitorConfig, Reading, SerialDevice};
use tracing_subscriber::EnvFilter;

const EXIT_USAGE: i32 = -1;
const EXIT_PORT: i32 = -2;
const EXIT_CONFIG: i32 = -3;

/// thermolog: serial sensor logger with hourly and daily averages.
#[derive(Parser)]
#[command(name = "thermolog", version, about)]
struct Cli {
    /// Serial port to read from (e.g. /dev/ttyUSB0 or COM3).
    port: String,

    /// JSON configuration file. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the log files.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Baud rate of the serial port.
    #[arg(long)]
    baud: Option<u32>,

    /// Seconds one read may block before the cycle continues empty.
    #[arg(long)]
    timeout_secs: Option<f64>,

    /// Number of cycles between two flushes to disk.
    #[arg(long)]
    flush_every: Option<u64>,

    /// Start with empty series instead of reloading the log files.
    #[arg(long)]
    no_restore: bool,
}

impl Cli {
    /// Merges command-line overrides into the base configuration.
    fn config(&self) -> Result<MonitorConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => MonitorConfig::load(path)?,
            None => MonitorConfig::default(),
        };

        if let Some(dir) = &self.log_dir {
            config.log_dir.clone_from(dir);
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(secs) = self.timeout_secs {
            config.poll_timeout = Duration::try_from_secs_f64(secs)
                .map_err(|e| format!("invalid --timeout-secs {secs}: {e}"))?;
        }
        if let Some(cycles) = self.flush_every {
            config.flush_every_cycles = cycles;
        }
        if self.no_restore {
            config.restore_on_start = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            // Printing to stderr only fails if stderr is gone; exit anyway.
            let _ = e.print();
            process::exit(EXIT_USAGE);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!(
            "Error: cannot create log directory '{}': {e}",
            config.log_dir.display()
        );
        process::exit(EXIT_CONFIG);
    }

    let mut device = match SerialDevice::open(&cli.port, config.baud_rate) {
        Ok(device) => device,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("Failed to open port '{}'! Terminating...", cli.port);
            process::exit(EXIT_PORT);
        }
    };
    if let Err(e) = device.set_read_timeout(config.poll_timeout) {
        tracing::warn!("keeping default read timeout: {e}");
    }

    let restore = config.restore_on_start;
    let mut ingest = match IngestLoop::new(config) {
        Ok(ingest) => ingest,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_CONFIG);
        }
    };
    if restore {
        let restored = ingest.restore();
        tracing::info!(restored, "loaded history from log files");
    }

    tracing::info!(port = %cli.port, open = device.is_open(), "polling sensor");
    ingest.run(&mut device, |report| match &report.reading {
        Reading::Accepted(token) => println!("Got: {token}"),
        Reading::Rejected(_) => {}
        Reading::Empty | Reading::Failed(_) => println!("Got nothing"),
    });
}
