//! gsm-trx — GSM base-station software-radio transceiver core.
//!
//! Bridges a raw I/Q sample stream from an SDR front-end with GSM
//! frame-aligned bursts. Run `gsm-trx --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod run;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = config::TrxConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run { device_args } => {
            let config = if cli.config.exists() {
                config::TrxConfig::load(&cli.config)?
            } else {
                eprintln!(
                    "No '{}' found; using defaults. Run `gsm-trx init` for an example.",
                    cli.config.display()
                );
                config::TrxConfig::default()
            };
            run::run(&config, device_args)?;
        }
    }

    Ok(())
}
