use crate::{control::DEFAULT_ETCD_ENDPOINT, runlog::DEFAULT_RUN_LOG};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// etcd v3 gateway the F-engine and ARX daemons listen on
    #[arg(long, default_value = DEFAULT_ETCD_ENDPOINT, global = true)]
    pub etcd: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load F-engine and ARX settings from a settings file (.toml or .json)
    Load {
        /// Settings file
        settings: PathBuf,
        /// SNAP2 boards to load, comma separated. Defaults to all of them
        #[arg(long, short, value_delimiter = ',')]
        #[arg(value_parser = clap::value_parser!(u8).range(1..=11))]
        boards: Vec<u8>,
        /// File to append a record of this run to
        #[arg(long, default_value = DEFAULT_RUN_LOG)]
        log_file: PathBuf,
        /// Log the commands instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Query the F-engines once and print the result as JSON
    Query {
        #[arg(value_enum)]
        what: Query,
        /// Board to query (adc-power only). Defaults to all of them
        #[arg(long, short)]
        #[arg(value_parser = clap::value_parser!(u8).range(1..=11))]
        board: Option<u8>,
    },
    /// Poll the F-engines and serve the results as Prometheus metrics
    Serve {
        /// Port to serve metrics on
        #[arg(long, default_value_t = 8083)]
        metrics_port: u16,
        /// Seconds between polls
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Query {
    /// Autocorrelation spectra of every digital signal
    Spectra,
    /// ADC input rms and power
    AdcPower,
    /// PFB overflow counts
    Overflow,
    /// ADC input histograms
    Histograms,
    /// Equalizer clip counts
    ClipCount,
}
