//! Moving values between the host and device memory.

use devcomp_ir::{Literal, Shape};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::DeviceBuffer;
use crate::error::{ServiceError, ServiceResult};
use crate::feed::{FeedRegistry, WaitError};
use crate::handle::{DeviceHandle, GlobalDataHandle};
use crate::platform::{Device, Platform};
use crate::registry::HandleRegistry;

pub struct TransferManager {
    registry: Arc<HandleRegistry>,
    platform: Arc<dyn Platform>,
    feeds: Arc<FeedRegistry>,
    default_outfeed_timeout: Option<Duration>,
}

impl TransferManager {
    pub fn new(
        registry: Arc<HandleRegistry>,
        platform: Arc<dyn Platform>,
        feeds: Arc<FeedRegistry>,
        default_outfeed_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            platform,
            feeds,
            default_outfeed_timeout,
        }
    }

    /// Resolve an explicit device, or the first device when none is given.
    pub fn target_device(&self, device: Option<DeviceHandle>) -> ServiceResult<Arc<Device>> {
        match device {
            Some(handle) => self.registry.resolve_device(handle),
            None => self.registry.devices().into_iter().next().ok_or_else(|| {
                ServiceError::InvalidArgument("the platform has no devices".to_string())
            }),
        }
    }

    /// Copy a literal into memory of `device` and register it.
    ///
    /// The registered shape is `shape` when given (carrying a layout),
    /// otherwise the literal's own shape.
    pub fn place(
        &self,
        literal: Literal,
        shape: Option<Shape>,
        device: &Arc<Device>,
    ) -> ServiceResult<GlobalDataHandle> {
        let shape = shape.unwrap_or_else(|| literal.shape());
        if let Some(unsupported) = shape
            .element_types()
            .into_iter()
            .find(|&ty| !self.platform.supports(ty))
        {
            return Err(ServiceError::TransferError(format!(
                "platform {} does not support element type {}",
                self.platform.name(),
                unsupported
            )));
        }

        let bytes = literal.to_le_bytes();
        if !device.memory.try_reserve(bytes.len()) {
            return Err(ServiceError::TransferError(format!(
                "device {} is out of memory: {} bytes requested, {} available",
                device,
                bytes.len(),
                device.memory.available()
            )));
        }
        if let Err(err) = self.platform.transfer(device.ordinal, &bytes) {
            device.memory.release(bytes.len());
            return Err(ServiceError::TransferError(err.to_string()));
        }

        let handle = self.registry.allocate_data(
            DeviceBuffer::from_literal(literal),
            shape,
            device,
            bytes.len(),
        );
        tracing::debug!(%handle, device = %device, bytes = bytes.len(), "placed buffer");
        Ok(handle)
    }

    pub fn transfer_to_server(
        &self,
        literal: Literal,
        device: Option<DeviceHandle>,
    ) -> ServiceResult<GlobalDataHandle> {
        literal
            .validate()
            .map_err(|err| ServiceError::TransferError(err.to_string()))?;
        let device = self.target_device(device)?;
        self.place(literal.coerced(), None, &device)
    }

    /// Read a value back, optionally re-laid-out to `shape_hint`.
    pub fn transfer_to_client(
        &self,
        handle: GlobalDataHandle,
        shape_hint: Option<&Shape>,
    ) -> ServiceResult<Literal> {
        let data = self.registry.resolve_data(handle)?;
        let literal = data.buffer.to_literal();
        let literal = match shape_hint {
            Some(hint) => literal
                .relayout(hint)
                .map_err(|err| ServiceError::LayoutError(err.to_string()))?,
            None => with_layout(literal, &data.shape),
        };
        tracing::debug!(%handle, shape = %literal.shape(), "transferred to client");
        Ok(literal)
    }

    pub fn transfer_to_infeed(
        &self,
        literal: Literal,
        replica_id: u32,
        device: Option<DeviceHandle>,
    ) -> ServiceResult<()> {
        literal
            .validate()
            .map_err(|err| ServiceError::TransferError(err.to_string()))?;
        let device = self.target_device(device)?;
        self.feeds
            .infeed(device.handle, replica_id)
            .push(literal.coerced());
        tracing::debug!(device = %device, replica_id, "queued infeed value");
        Ok(())
    }

    /// Block until the replica's outfeed yields a value matching
    /// `shape_hint`.
    ///
    /// A mismatching value stays queued. Without a timeout (explicit or
    /// configured) the wait is unbounded.
    pub fn transfer_from_outfeed(
        &self,
        shape_hint: &Shape,
        replica_id: u32,
        device: Option<DeviceHandle>,
        timeout: Option<Duration>,
    ) -> ServiceResult<Literal> {
        let device = self.target_device(device)?;
        let queue = self.feeds.outfeed(device.handle, replica_id);
        let timeout = timeout.or(self.default_outfeed_timeout);
        let started = Instant::now();
        let value = queue
            .pop(Some(shape_hint), timeout.map(|t| started + t), None)
            .map_err(|err| match err {
                WaitError::TimedOut => ServiceError::Timeout {
                    what: format!("outfeed of replica {} on {}", replica_id, device),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                },
                WaitError::Mismatch(actual) => ServiceError::ShapeMismatch(format!(
                    "outfeed value has shape {} but {} was requested",
                    actual, shape_hint
                )),
                WaitError::Cancelled => ServiceError::Cancelled,
            })?;
        value
            .relayout(shape_hint)
            .map_err(|err| ServiceError::LayoutError(err.to_string()))
    }
}

/// Attach the layouts recorded in `shape` to a literal read from a buffer.
fn with_layout(literal: Literal, shape: &Shape) -> Literal {
    match literal.relayout(shape) {
        Ok(laid_out) => laid_out,
        Err(_) => literal,
    }
}
