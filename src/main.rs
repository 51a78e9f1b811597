//! NTRIP rover for RTK GNSS receivers.
//!
//! Streams RTCM corrections from an NTRIP caster to a serial-attached GNSS
//! receiver and tracks the receiver's NMEA fix.  With `mountpoint = auto`
//! the rover waits for a first fix, fetches the caster source-table and
//! subscribes to the closest mount point.
//!
//! Usage:
//!   rtk-rover -c config.ini
//!   rtk-rover -c config.ini --syslog    # log to syslog instead of stderr

mod config;
mod crc24q;
mod error;
mod gnss;
mod ntrip;
mod output;
mod rover;
mod rtcm;
mod serial;
mod ubx;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::error;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "rtk-rover", about = "NTRIP client for RTK GPS receivers")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "config.ini")]
    config: PathBuf,

    /// Log to syslog instead of stderr.
    #[arg(long)]
    syslog: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rtk-rover: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("rtk-rover: {e}");
        process::exit(1);
    }

    setup_logging(cli.syslog).expect("failed to set up logging");
    log::info!("Config loaded from {}", cli.config.display());

    let mut rover = match rover::Rover::start(cfg).await {
        Ok(r) => r,
        Err(e) => {
            error!("Startup failed: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = rover.run().await {
        error!("{e}");
        process::exit(1);
    }
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "rtk-rover".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }
    Ok(())
}
