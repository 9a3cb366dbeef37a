use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use srpico_host::PatternTrigger;

use crate::config::{get_config_dir, get_data_dir};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(author, version = version(), about)]
pub struct Cli {
    /// Serial port the sampler is attached to
    #[arg(short, long, global = true, value_name = "PATH")]
    pub port: Option<String>,

    /// Baud rate; ignored by USB CDC ports but needed for UART bridges
    #[arg(short, long, global = true)]
    pub baud: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print what the device reports about itself
    Identify {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the pin behind every channel
    Names,
    /// Arm one capture and write the samples out
    Capture(CaptureArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CaptureArgs {
    /// Sample rate in samples per second
    #[arg(short, long)]
    pub rate: Option<u32>,

    /// Samples to keep
    #[arg(short = 'n', long)]
    pub limit: Option<u32>,

    /// Digital channels to enable, counted from D0
    #[arg(short, long)]
    pub digital: Option<u8>,

    /// Analog channels to enable, counted from A0
    #[arg(short, long)]
    pub analog: Option<u8>,

    /// Software trigger, e.g. `0=r,3=1` (0, 1, r, f or e per channel)
    #[arg(short, long)]
    pub trigger: Option<PatternTrigger>,

    /// Percentage of the kept samples taken from before the trigger
    #[arg(long, value_name = "PERCENT")]
    pub pretrigger: Option<u8>,

    /// Stream until interrupted instead of stopping at the limit
    #[arg(short, long)]
    pub continuous: bool,

    /// Output format
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Output file; stdout when omitted
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

const VERSION_MESSAGE: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "-",
    "(",
    env!("VERGEN_BUILD_DATE"),
    ")"
);

pub fn version() -> String {
    let author = clap::crate_authors!();
    let git = option_env!("VERGEN_GIT_DESCRIBE").unwrap_or("unknown");
    let config_dir_path = get_config_dir().display().to_string();
    let data_dir_path = get_data_dir().display().to_string();

    format!(
        "\
{VERSION_MESSAGE} {git}

Authors: {author}

Config directory: {config_dir_path}
Data directory: {data_dir_path}"
    )
}
