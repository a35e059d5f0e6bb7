//! Configuration file support.
//!
//! Search order:
//! 1. `--config <path>`
//! 2. `DEVCOMP_CONFIG` environment variable
//! 3. `devcomp.toml` in the current directory
//! 4. built-in defaults
//!
//! An explicitly named file that cannot be read is an error; the implicit
//! locations are skipped when absent.

use anyhow::{Context, Result};
use devcomp_service::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::logging::LogFormat;

pub const CONFIG_ENV: &str = "DEVCOMP_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "devcomp.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub with_targets: bool,
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            level: "info".to_string(),
            with_targets: true,
            with_thread_ids: false,
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Resolve the configuration to use, returning it with the file it came
    /// from.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::discover_in(explicit, env.as_deref(), Path::new("."))
    }

    /// [`CliConfig::discover`] with the environment and working directory
    /// supplied by the caller.
    pub fn discover_in(
        explicit: Option<&Path>,
        env: Option<&Path>,
        dir: &Path,
    ) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit.or(env) {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let local = dir.join(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return Ok((Self::load(&local)?, Some(local)));
        }
        Ok((Self::default(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: CliConfig = toml::from_str(
            r#"
            [service.platform]
            device_count = 4

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.service.platform.device_count, 4);
        assert_eq!(config.service.platform.name, "host");
        assert_eq!(config.service.cache.capacity, 128);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_unknown_format_rejected() {
        let parsed: Result<CliConfig, _> = toml::from_str("[logging]\nformat = \"xml\"\n");
        assert!(parsed.is_err());
    }
}
