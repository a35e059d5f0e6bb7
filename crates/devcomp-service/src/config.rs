//! Service configuration.

use devcomp_ir::ElementType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub platform: PlatformConfig,
    pub cache: CacheConfig,
    /// Default bound on outfeed waits; unset waits indefinitely.
    pub outfeed_timeout_ms: Option<u64>,
    /// Seed used when a request leaves its seed unset.
    pub default_seed: Option<u64>,
}

impl ServiceConfig {
    pub fn with_devices(mut self, device_count: usize) -> Self {
        self.platform.device_count = device_count;
        self
    }

    pub fn with_memory_capacity(mut self, bytes: usize) -> Self {
        self.platform.memory_capacity_bytes = bytes;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache.capacity = capacity;
        self
    }

    pub fn outfeed_timeout(&self) -> Option<Duration> {
        self.outfeed_timeout_ms.map(Duration::from_millis)
    }
}

/// Description of the host platform the service drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub name: String,
    pub device_count: usize,
    /// Capacity of each device's memory.
    pub memory_capacity_bytes: usize,
    pub supported_types: Vec<ElementType>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            device_count: 1,
            memory_capacity_bytes: 256 * 1024 * 1024,
            supported_types: ElementType::ALL.to_vec(),
        }
    }
}

/// Compilation cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached executables; 0 disables caching.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 128 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"platform": {"device_count": 4}}"#).unwrap();
        assert_eq!(config.platform.device_count, 4);
        assert_eq!(config.platform.name, "host");
        assert_eq!(config.cache.capacity, 128);
        assert!(config.outfeed_timeout().is_none());
    }

    #[test]
    fn test_builders() {
        let config = ServiceConfig::default()
            .with_devices(2)
            .with_memory_capacity(64)
            .with_cache_capacity(0);
        assert_eq!(config.platform.device_count, 2);
        assert_eq!(config.platform.memory_capacity_bytes, 64);
        assert_eq!(config.cache.capacity, 0);
    }
}
