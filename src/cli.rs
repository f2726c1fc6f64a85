//! CLI definitions for gsm-trx.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "gsm-trx",
    version,
    about = "GSM base-station software-radio transceiver core\n\nBridges a timestamped I/Q sample stream from an SDR front-end with GSM frame-aligned bursts.",
    long_about = None
)]
pub struct Cli {
    /// Path to trx.toml config file
    #[clap(long, short, default_value = "trx.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the transceiver pipeline (Ctrl-C to stop)
    Run {
        /// Device discovery string, e.g. "type=b200"; overrides [device].args
        device_args: Option<String>,
    },

    /// Print an example trx.toml to stdout
    Init,
}
