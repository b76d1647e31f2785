//! # Reservation Object Stress Binary
//!
//! Soak-tests a reservation object with concurrent lock-free readers.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (or /etc/resv/stress.toml when present)
//! resv_stress
//!
//! # Explicit config, overridden from the command line
//! resv_stress --config config/stress.toml --order backward --fences 65536
//!
//! # Machine-readable report
//! resv_stress --rounds 2 --readers 8 --seed 42 --json
//! ```

#![deny(warnings)]

use clap::Parser;
use resv_common::config::{ConfigLoader, LogLevel};
use resv_common::consts::DEFAULT_CONFIG_PATH;
use resv_common::init_tracing;
use resv_stress::{InsertOrder, StressConfig, StressError, StressReport, run_stress};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Reservation object stress driver
#[derive(Parser, Debug)]
#[command(name = "resv_stress")]
#[command(version)]
#[command(about = "Randomized and concurrent soak driver for reservation objects")]
#[command(long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Shared fences inserted per round
    #[arg(short, long)]
    fences: Option<u64>,

    /// Insertion order
    #[arg(short, long, value_enum)]
    order: Option<InsertOrder>,

    /// Concurrent reader threads
    #[arg(short, long)]
    readers: Option<usize>,

    /// Rounds to run
    #[arg(long)]
    rounds: Option<u64>,

    /// Seed for random insertion orders
    #[arg(long)]
    seed: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs and the final report in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    match run(&args) {
        Ok(report) if report.is_clean() => {}
        Ok(report) => {
            error!(torn = report.torn_snapshots, "stress run saw torn snapshots");
            std::process::exit(2);
        }
        Err(e) => {
            error!("stress run failed: {}", e);
            eprintln!("resv_stress: {e}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<StressReport, StressError> {
    let config = load_config(args)?;

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config.shared.log_level
    };
    init_tracing(level, args.json);
    info!(
        "Reservation stress driver v{} starting ({})",
        env!("CARGO_PKG_VERSION"),
        config.shared.service_name
    );

    let report = run_stress(&config)?;
    print_report(&report, args.json);
    Ok(report)
}

/// Load the configuration file, then apply command-line overrides.
fn load_config(args: &Args) -> Result<StressConfig, StressError> {
    let mut config = match &args.config {
        Some(path) => StressConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            StressConfig::load(Path::new(DEFAULT_CONFIG_PATH))?
        }
        None => StressConfig::default(),
    };

    if let Some(fences) = args.fences {
        config.run.fences = fences;
    }
    if let Some(order) = args.order {
        config.run.order = order;
    }
    if let Some(readers) = args.readers {
        config.run.readers = readers;
    }
    if let Some(rounds) = args.rounds {
        config.run.rounds = rounds;
    }
    if let Some(seed) = args.seed {
        config.run.seed = seed;
    }

    config.validate()?;
    Ok(config)
}

fn print_report(report: &StressReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Failed to serialize report: {e}"),
        }
        return;
    }

    println!("service        : {}", report.service_name);
    println!("rounds         : {}", report.rounds);
    println!("order          : {}", report.order);
    println!("inserts        : {}", report.inserts);
    println!("readers        : {}", report.readers);
    println!("snapshots      : {}", report.snapshots);
    println!("torn snapshots : {}", report.torn_snapshots);
    println!("oom failures   : {}", report.oom_failures);
    println!("validations    : {}", report.validations);
    println!("elapsed        : {} ms", report.elapsed_ms);
}
