//! CLI argument definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "devcomp")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Don't load any configuration file
    #[arg(long, global = true)]
    pub no_config: bool,

    /// Override the number of devices
    #[arg(long, global = true)]
    pub devices: Option<usize>,

    /// Override the log format
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Override the log filter (e.g. `devcomp_service=debug`)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Answer JSON requests read line by line from stdin
    Serve,

    /// List the platform's devices
    Devices,

    /// Print structural statistics of a graph file
    Stats {
        /// Graph in JSON form
        graph: PathBuf,
    },

    /// Compile and run a graph once, printing the result literal
    Run {
        /// Graph in JSON form
        graph: PathBuf,

        /// Argument literals in JSON form, in parameter order
        #[arg(short, long = "arg")]
        args: Vec<PathBuf>,

        /// Seed for random number generation
        #[arg(long)]
        seed: Option<u64>,

        /// Number of replicas
        #[arg(long, default_value_t = 1)]
        replicas: usize,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}
