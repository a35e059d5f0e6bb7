//! Library half of the `devcomp` binary, split out so the configuration
//! and request loop can be tested without spawning a process.

pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;
pub mod serve;

pub use config::{CliConfig, LoggingConfig};
pub use logging::LogFormat;
pub use serve::{serve, ServeSummary};
