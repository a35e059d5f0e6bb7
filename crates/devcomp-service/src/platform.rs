//! Platform drivers and device memory accounting.

use devcomp_ir::ElementType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

use crate::config::PlatformConfig;
use crate::handle::DeviceHandle;

/// Failure reported by a platform driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("driver error on device {ordinal}: {message}")]
pub struct DriverError {
    pub ordinal: usize,
    pub message: String,
}

/// Low-level driver for a family of devices.
///
/// The service owns handle bookkeeping and memory accounting; a platform
/// only describes its devices and moves bytes onto them.
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    fn device_count(&self) -> usize;

    /// Memory capacity of the device at `ordinal`.
    fn memory_capacity(&self, ordinal: usize) -> usize;

    fn supports(&self, element_type: ElementType) -> bool;

    /// Copy `bytes` into memory of the device at `ordinal`.
    fn transfer(&self, ordinal: usize, bytes: &[u8]) -> Result<(), DriverError>;
}

/// In-process platform whose devices are host memory regions.
#[derive(Debug)]
pub struct HostPlatform {
    name: String,
    device_count: usize,
    capacity: usize,
    supported: Vec<ElementType>,
    bytes_transferred: AtomicU64,
}

impl HostPlatform {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            name: config.name.clone(),
            device_count: config.device_count,
            capacity: config.memory_capacity_bytes,
            supported: config.supported_types.clone(),
            bytes_transferred: AtomicU64::new(0),
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }
}

impl Platform for HostPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_count(&self) -> usize {
        self.device_count
    }

    fn memory_capacity(&self, _ordinal: usize) -> usize {
        self.capacity
    }

    fn supports(&self, element_type: ElementType) -> bool {
        self.supported.contains(&element_type)
    }

    fn transfer(&self, ordinal: usize, bytes: &[u8]) -> Result<(), DriverError> {
        if ordinal >= self.device_count {
            return Err(DriverError {
                ordinal,
                message: format!("platform has {} devices", self.device_count),
            });
        }
        self.bytes_transferred
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Capacity accounting for one device.
#[derive(Debug)]
pub struct DeviceMemory {
    capacity: usize,
    used: AtomicUsize,
}

impl DeviceMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    /// Reserve `bytes`, returning false when the device would overflow.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.capacity)
            })
            .is_ok()
    }

    pub fn release(&self, bytes: usize) {
        // Never wraps below zero.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }
}

/// A device registered with the service.
#[derive(Debug)]
pub struct Device {
    pub handle: DeviceHandle,
    pub ordinal: usize,
    pub platform: String,
    pub memory: DeviceMemory,
}

impl Device {
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            handle: self.handle,
            ordinal: self.ordinal,
            platform: self.platform.clone(),
            memory_capacity: self.memory.capacity(),
            memory_used: self.memory.used(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.ordinal)
    }
}

/// Serializable snapshot of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub handle: DeviceHandle,
    pub ordinal: usize,
    pub platform: String,
    pub memory_capacity: usize,
    pub memory_used: usize,
}
