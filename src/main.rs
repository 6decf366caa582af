//! Stress the KVM guest_memfd allocation path.
//!
//! Repeatedly allocates anonymous and guest_memfd-backed memory with random
//! sizes, writes and verifies a byte pattern in each page, and releases
//! everything.  Exits 0 only if every iteration completes; any allocation,
//! mapping, release, or verification failure prints a diagnostic to stderr
//! and exits 1.
//!
//! Usage:
//!   guest-memfd-stress [--mode anon|guest|mixed] [--skip-no-direct-map]
//!                      [--iterations N] [--seed N]

use clap::Parser;
use guest_memfd_stress::stress::{Mode, StressConfig, StressDriver, DEFAULT_ITERATIONS};
use std::process;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(name = "guest-memfd-stress")]
#[command(about = "Stress test for the KVM guest_memfd allocation path")]
#[command(version)]
struct Cli {
    /// Allocation policy: "anon", "guest", or "mixed".
    #[arg(long, default_value = "mixed")]
    mode: String,

    /// Omit GUEST_MEMFD_FLAG_NO_DIRECT_MAP when creating guest_memfds.
    #[arg(long)]
    skip_no_direct_map: bool,

    /// Number of allocate/verify/release iterations.
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: u64,

    /// RNG seed for reproducible runs (defaults to the current time).
    #[arg(long)]
    seed: Option<u64>,
}

/// Seed for manual stress runs, where reproducibility doesn't matter.
fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Validate the mode before touching any resource.
    let mode = match Mode::from_str(&cli.mode) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if cli.skip_no_direct_map {
        println!("Skipping GUEST_MEMFD_FLAG_NO_DIRECT_MAP");
    }

    let config = StressConfig {
        mode,
        iterations: cli.iterations,
        no_direct_map: !cli.skip_no_direct_map,
        seed: cli.seed.unwrap_or_else(time_seed),
    };

    let mut driver = match StressDriver::new(config) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = driver.run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}
