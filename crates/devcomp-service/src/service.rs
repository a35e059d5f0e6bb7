//! The service facade: one entry point per operation.

use devcomp_ir::{ComputationGraph, Literal, Shape};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::compile::{CompilationAdapter, Compiler, HostCompiler};
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::execution::{ExecuteResponse, ExecutionCoordinator, ExecutionPhase};
use crate::feed::FeedRegistry;
use crate::handle::{
    ChannelHandle, ChannelKind, DeviceHandle, ExecutionHandle, ExecutionToken, GlobalDataHandle,
};
use crate::introspection::{self, GraphStats, ServiceStats};
use crate::options::{DebugOptions, ExecutionOptions};
use crate::platform::{DeviceInfo, HostPlatform, Platform};
use crate::registry::HandleRegistry;
use crate::transfer::TransferManager;

/// One graph execution inside an `ExecuteGraphParallel` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteGraphRequest {
    pub graph: ComputationGraph,
    #[serde(default)]
    pub arguments: Vec<GlobalDataHandle>,
    #[serde(default)]
    pub options: ExecutionOptions,
}

/// Device computation service.
///
/// Clients hold only opaque handles; the service owns every buffer,
/// executable, device and channel behind them.
pub struct Service {
    config: ServiceConfig,
    registry: Arc<HandleRegistry>,
    platform: Arc<dyn Platform>,
    feeds: Arc<FeedRegistry>,
    transfers: Arc<TransferManager>,
    compiler: CompilationAdapter,
    coordinator: ExecutionCoordinator,
}

impl Service {
    /// Service over the host platform described by `config`.
    pub fn new(config: ServiceConfig) -> ServiceResult<Self> {
        let platform: Arc<dyn Platform> = Arc::new(HostPlatform::new(&config.platform));
        Self::with_backends(config, platform, Arc::new(HostCompiler::new()))
    }

    pub fn with_backends(
        config: ServiceConfig,
        platform: Arc<dyn Platform>,
        compiler: Arc<dyn Compiler>,
    ) -> ServiceResult<Self> {
        let registry = Arc::new(HandleRegistry::new());
        for ordinal in 0..platform.device_count() {
            registry.register_device(ordinal, platform.name(), platform.memory_capacity(ordinal));
        }
        let feeds = Arc::new(FeedRegistry::new());
        let transfers = Arc::new(TransferManager::new(
            Arc::clone(&registry),
            Arc::clone(&platform),
            Arc::clone(&feeds),
            config.outfeed_timeout(),
        ));
        let compiler =
            CompilationAdapter::new(compiler, config.cache.capacity, Arc::clone(&registry));
        let coordinator = ExecutionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&transfers),
            Arc::clone(&feeds),
            config.default_seed,
        )?;
        tracing::info!(
            platform = platform.name(),
            devices = platform.device_count(),
            cache_capacity = config.cache.capacity,
            "service started"
        );
        Ok(Self {
            config,
            registry,
            platform,
            feeds,
            transfers,
            compiler,
            coordinator,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn platform_name(&self) -> &str {
        self.platform.name()
    }

    pub fn compile(
        &self,
        graph: &ComputationGraph,
        options: &ExecutionOptions,
    ) -> ServiceResult<ExecutionHandle> {
        self.compiler.compile(graph, options)
    }

    pub fn release_executable(&self, handle: ExecutionHandle) -> ServiceResult<()> {
        self.registry.release_executable(handle)
    }

    pub fn execute(
        &self,
        handle: ExecutionHandle,
        arguments: &[GlobalDataHandle],
        options: &ExecutionOptions,
    ) -> ServiceResult<ExecuteResponse> {
        let executable = self.registry.resolve_executable(handle)?;
        self.coordinator.execute(executable, arguments, options, false)
    }

    pub fn execute_async(
        &self,
        handle: ExecutionHandle,
        arguments: &[GlobalDataHandle],
        options: &ExecutionOptions,
    ) -> ServiceResult<ExecutionToken> {
        let executable = self.registry.resolve_executable(handle)?;
        self.coordinator
            .execute_async(executable, arguments, options, false)
    }

    pub fn wait_for_execution(&self, token: ExecutionToken) -> ServiceResult<ExecuteResponse> {
        self.coordinator.wait(token)
    }

    pub fn release_execution(&self, token: ExecutionToken) -> ServiceResult<()> {
        self.coordinator.release(token)
    }

    pub fn cancel_execution(&self, token: ExecutionToken) -> ServiceResult<ExecutionPhase> {
        self.coordinator.cancel(token)
    }

    pub fn execution_phase(&self, token: ExecutionToken) -> ServiceResult<ExecutionPhase> {
        self.coordinator.phase(token)
    }

    /// Compile (through the cache) and run a graph without registering an
    /// executable handle.
    pub fn execute_graph(
        &self,
        graph: &ComputationGraph,
        arguments: &[GlobalDataHandle],
        options: &ExecutionOptions,
    ) -> ServiceResult<ExecuteResponse> {
        let lookup = self.compiler.build(graph, options)?;
        self.coordinator
            .execute(lookup.executable, arguments, options, lookup.hit)
    }

    /// Dispatch every request before waiting on any of them.
    ///
    /// Requests without a device assignment are spread round-robin over
    /// the devices. Each slot holds its own outcome.
    pub fn execute_graph_parallel(
        &self,
        requests: &[ExecuteGraphRequest],
    ) -> Vec<ServiceResult<ExecuteResponse>> {
        let devices = self.registry.devices();
        let tokens: Vec<ServiceResult<ExecutionToken>> = requests
            .iter()
            .enumerate()
            .map(|(index, request)| {
                let lookup = self.compiler.build(&request.graph, &request.options)?;
                let mut options = request.options.clone();
                let replicas = lookup.executable.num_replicas;
                if options.device_handles.is_empty()
                    && lookup.executable.device_assignment.is_empty()
                    && replicas <= devices.len()
                {
                    options.device_handles = (0..replicas)
                        .map(|r| devices[(index + r) % devices.len()].handle)
                        .collect();
                }
                self.coordinator.execute_async(
                    lookup.executable,
                    &request.arguments,
                    &options,
                    lookup.hit,
                )
            })
            .collect();

        tracing::info!(requests = requests.len(), "parallel batch dispatched");
        tokens
            .into_iter()
            .map(|token| {
                let token = token?;
                let result = self.coordinator.wait(token);
                self.coordinator.release(token)?;
                result
            })
            .collect()
    }

    pub fn transfer_to_server(
        &self,
        literal: Literal,
        device: Option<DeviceHandle>,
    ) -> ServiceResult<GlobalDataHandle> {
        self.transfers.transfer_to_server(literal, device)
    }

    pub fn transfer_to_client(
        &self,
        handle: GlobalDataHandle,
        shape_hint: Option<&Shape>,
    ) -> ServiceResult<Literal> {
        self.transfers.transfer_to_client(handle, shape_hint)
    }

    pub fn transfer_to_infeed(
        &self,
        literal: Literal,
        replica_id: u32,
        device: Option<DeviceHandle>,
    ) -> ServiceResult<()> {
        self.transfers.transfer_to_infeed(literal, replica_id, device)
    }

    pub fn transfer_from_outfeed(
        &self,
        shape_hint: &Shape,
        replica_id: u32,
        device: Option<DeviceHandle>,
        timeout: Option<Duration>,
    ) -> ServiceResult<Literal> {
        self.transfers
            .transfer_from_outfeed(shape_hint, replica_id, device, timeout)
    }

    /// Release data handles. All are validated before any is released.
    pub fn unregister(&self, handles: &[GlobalDataHandle]) -> ServiceResult<()> {
        self.registry.release_data_many(handles)?;
        tracing::debug!(count = handles.len(), "unregistered data handles");
        Ok(())
    }

    pub fn deconstruct_tuple(&self, handle: GlobalDataHandle) -> ServiceResult<Vec<GlobalDataHandle>> {
        self.registry.deconstruct(handle)
    }

    /// Like [`Service::deconstruct_tuple`], except that an array handle
    /// unpacks to itself.
    pub fn unpack(&self, handle: GlobalDataHandle) -> ServiceResult<Vec<GlobalDataHandle>> {
        match self.registry.deconstruct(handle) {
            Err(ServiceError::NotATuple(_)) => Ok(vec![handle]),
            other => other,
        }
    }

    /// Handles of the first `count` devices.
    pub fn get_device_handles(&self, count: usize) -> ServiceResult<Vec<DeviceHandle>> {
        let devices = self.registry.devices();
        if count > devices.len() {
            return Err(ServiceError::InvalidArgument(format!(
                "requested {} devices but the platform has {}",
                count,
                devices.len()
            )));
        }
        Ok(devices.iter().take(count).map(|d| d.handle).collect())
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.registry.devices().iter().map(|d| d.info()).collect()
    }

    pub fn create_channel_handle(&self, kind: ChannelKind) -> ChannelHandle {
        let channel = self.registry.create_channel(kind);
        tracing::debug!(handle = %channel.handle, ?kind, "created channel");
        channel.handle
    }

    pub fn get_shape(&self, handle: GlobalDataHandle) -> ServiceResult<Shape> {
        Ok(self.registry.resolve_data(handle)?.shape)
    }

    pub fn computation_graph_stats(
        &self,
        graph: &ComputationGraph,
        debug_options: &DebugOptions,
    ) -> ServiceResult<GraphStats> {
        introspection::computation_graph_stats(graph, debug_options)
    }

    /// Wait for work already queued on the device, then invalidate every
    /// data handle on it and empty its feed queues.
    ///
    /// Returns the number of invalidated handles.
    pub fn reset_device(&self, device: DeviceHandle) -> ServiceResult<usize> {
        let resolved = self.registry.resolve_device(device)?;
        self.coordinator.barrier(device)?;
        let invalidated = self.registry.invalidate_device(device);
        let dropped = self.feeds.clear_device(device);
        tracing::info!(device = %resolved, invalidated, dropped_feed_values = dropped, "device reset");
        Ok(invalidated)
    }

    pub fn service_stats(&self) -> ServiceStats {
        ServiceStats {
            handles: self.registry.counts(),
            executions_tracked: self.coordinator.tracked_count(),
            executions_in_flight: self.coordinator.in_flight_count(),
            cache: self.compiler.cache_stats(),
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcomp_ir::{BinaryOp, ElementType};

    #[test]
    fn test_unpack_array_returns_itself() {
        let service = Service::new(ServiceConfig::default()).unwrap();
        let handle = service.transfer_to_server(Literal::s32(3), None).unwrap();
        assert_eq!(service.unpack(handle).unwrap(), vec![handle]);
        assert_eq!(
            service.deconstruct_tuple(handle).unwrap_err(),
            ServiceError::NotATuple(handle.0)
        );
    }

    #[test]
    fn test_get_device_handles() {
        let service = Service::new(ServiceConfig::default().with_devices(3)).unwrap();
        assert_eq!(service.get_device_handles(2).unwrap().len(), 2);
        assert!(matches!(
            service.get_device_handles(4),
            Err(ServiceError::InvalidArgument(_))
        ));
        assert_eq!(service.devices().len(), 3);
    }

    #[test]
    fn test_execute_graph_registers_no_executable() {
        let service = Service::new(ServiceConfig::default()).unwrap();
        let mut graph = ComputationGraph::new("double");
        let x = graph.parameter(0, Shape::scalar(ElementType::F64)).unwrap();
        graph.binary(BinaryOp::Add, x, x).unwrap();
        let arg = service
            .transfer_to_server(Literal::scalar(ElementType::F64, 2.5), None)
            .unwrap();
        let response = service
            .execute_graph(&graph, &[arg], &ExecutionOptions::default())
            .unwrap();
        assert_eq!(
            service.transfer_to_client(response.output, None).unwrap(),
            Literal::scalar(ElementType::F64, 5.0)
        );
        assert_eq!(service.service_stats().handles.executables, 0);
    }

    #[test]
    fn test_get_shape_keeps_layout() {
        let service = Service::new(ServiceConfig::default()).unwrap();
        let handle = service
            .transfer_to_server(Literal::vector(ElementType::U32, &[1.0, 2.0]), None)
            .unwrap();
        assert_eq!(
            service.get_shape(handle).unwrap(),
            Shape::array(ElementType::U32, vec![2])
        );
        service.unregister(&[handle]).unwrap();
        assert!(matches!(
            service.get_shape(handle),
            Err(ServiceError::InvalidHandle { .. })
        ));
    }
}
