//! `tracing` subscriber setup.
//!
//! Logs always go to stderr so stdout stays free for responses.

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output with colors.
    Pretty,
    /// Single-line output without colors.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Build the filter: `RUST_LOG` wins over the configured directive.
pub fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| anyhow!("Invalid log filter {:?}: {}", level, e)),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(&config.level)?;
    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(config.with_targets)
                    .with_thread_ids(config.with_thread_ids)
                    .pretty(),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(config.with_targets)
                    .with_thread_ids(config.with_thread_ids)
                    .with_ansi(false)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(config.with_targets)
                    .with_thread_ids(config.with_thread_ids)
                    .json(),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize tracing: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter("devcomp_service=loudest").is_err());
        }
        assert!(env_filter("debug").is_ok());
    }
}
