//! echo-loop - run the echo engine against a loopback or a real audio device
//!
//! Captures audio, runs it through the echo, plays it back, reconfigures
//! the delay once halfway through, and reports the buffer census at the end.
//!
//! ## Command line flags
//!
//! - `--config <PATH>`: config file (default ~/.config/echo-loop/config.yaml)
//! - `--seconds <N>`, `--delay-ms <MS>`, `--decay <W>`: override the config
//! - `--driver loopback|cpal`: device backend
//! - `--write-config`: save the effective config and exit

mod config;
mod driver;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use echo_core::config::{load_config, save_config, CheckedConfig};

use config::{default_config_path, LoopConfig};
use driver::DriverKind;

/// Real-time capture -> echo -> playback loop
#[derive(Parser, Debug)]
#[command(name = "echo-loop")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to stream
    #[arg(short, long)]
    seconds: Option<f32>,

    /// Initial echo delay in milliseconds
    #[arg(long)]
    delay_ms: Option<u32>,

    /// Echo feedback weight in [0, 1)
    #[arg(long)]
    decay: Option<f32>,

    /// Device backend
    #[arg(long, value_enum)]
    driver: Option<DriverKind>,

    /// Save the effective config to the config path and exit
    #[arg(long)]
    write_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut LoopConfig) {
        if let Some(seconds) = self.seconds {
            config.driver.run_seconds = seconds;
        }
        if let Some(delay_ms) = self.delay_ms {
            config.engine.initial_delay_ms = delay_ms;
        }
        if let Some(decay) = self.decay {
            config.engine.initial_decay = decay;
        }
        if let Some(kind) = self.driver {
            config.driver.kind = kind;
        }
    }
}

fn main() -> Result<()> {
    // Set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    log::info!("echo-loop v{} starting up", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config: LoopConfig = load_config(&config_path);
    cli.apply(&mut config);
    config.check()?;

    if cli.write_config {
        save_config(&config, &config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let summary = match config.driver.kind {
        DriverKind::Loopback => driver::loopback::run(config.engine.clone(), &config.driver)?,
        #[cfg(feature = "cpal-backend")]
        DriverKind::Cpal => driver::cpal::run(config.engine.clone(), &config.driver)?,
        #[cfg(not(feature = "cpal-backend"))]
        DriverKind::Cpal => bail!("echo-loop was built without the cpal-backend feature"),
    };

    log::info!("Run finished: {}", summary);
    if !summary.census.is_balanced() {
        bail!("buffers lost during the run: {}", summary.census);
    }
    Ok(())
}
