//! Sensor simulator for exercising thermolog without hardware.
//!
//! Writes `Iteration <value>` lines to a serial port, one per interval,
//! with values drawn uniformly from 20.0..=30.0 and rounded to tenths.
//! Pair it with a virtual port pair (e.g. `socat -d -d pty,raw,echo=0
//! pty,raw,echo=0`) and point `thermolog` at the other end.

use std::io::{ErrorKind, Write};
use std::process;
use std::thread;
use std::time::Duration;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

const EXIT_USAGE: i32 = -1;
const EXIT_PORT: i32 = -2;

/// thermolog-sim: writes fake temperature readings to a serial port.
#[derive(Parser)]
#[command(name = "thermolog-sim", version, about)]
struct Cli {
    /// Serial port to write to.
    port: String,

    /// Seconds between two readings.
    #[arg(long, default_value = "1.0")]
    interval: f64,

    /// Baud rate of the serial port.
    #[arg(long, default_value = "115200")]
    baud: u32,

    /// Seed for reproducible readings.
    #[arg(long)]
    seed: Option<u64>,
}

/// Next reading, rounded to one decimal.
fn next_reading(rng: &mut impl Rng) -> f64 {
    let value: f64 = rng.gen_range(20.0..=30.0);
    (value * 10.0).round() / 10.0
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            process::exit(EXIT_USAGE);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Ok(interval) = Duration::try_from_secs_f64(cli.interval) else {
        eprintln!("Error: invalid --interval {}", cli.interval);
        process::exit(EXIT_USAGE);
    };

    let mut port = match serialport::new(&cli.port, cli.baud)
        .timeout(Duration::from_secs(1))
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("Failed to open port '{}'! Terminating...", cli.port);
            process::exit(EXIT_PORT);
        }
    };

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    tracing::info!(port = %cli.port, ?interval, "simulating sensor");
    loop {
        let value = next_reading(&mut rng);
        let line = format!("Iteration {value:.1}\n");
        match port.write_all(line.as_bytes()).and_then(|()| port.flush()) {
            Ok(()) => tracing::debug!(value, "sent reading"),
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                tracing::warn!("write timed out, is anyone reading?");
            }
            Err(e) => {
                tracing::error!("write to '{}' failed: {e}", cli.port);
                process::exit(EXIT_PORT);
            }
        }
        thread::sleep(interval);
    }
}
