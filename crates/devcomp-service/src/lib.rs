//! # devcomp-service
//!
//! Handle-based service that compiles computation graphs, moves data
//! between clients and devices, and runs executables asynchronously.
//!
//! ## Core pieces
//! - **HandleRegistry**: owns every device-resident value, executable,
//!   device and channel behind opaque, never-reused handles
//! - **CompilationAdapter**: validation, optimization passes and a
//!   single-flight compilation cache
//! - **TransferManager**: client/device transfers and the infeed/outfeed queues
//! - **ExecutionCoordinator**: one worker thread per device, replicated
//!   execution and token lifecycle (wait, cancel, release)
//! - **Service**: the facade exposing all operations, plus a JSON wire
//!   protocol in [`wire`]
//!
//! ```
//! use devcomp_ir::{BinaryOp, ComputationGraph, ElementType, Literal, Shape};
//! use devcomp_service::{ExecutionOptions, Service, ServiceConfig};
//!
//! let service = Service::new(ServiceConfig::default()).unwrap();
//! let mut graph = ComputationGraph::new("add_one");
//! let x = graph.parameter(0, Shape::scalar(ElementType::S32)).unwrap();
//! let one = graph.constant(Literal::s32(1)).unwrap();
//! graph.binary(BinaryOp::Add, x, one).unwrap();
//!
//! let exe = service.compile(&graph, &ExecutionOptions::default()).unwrap();
//! let arg = service.transfer_to_server(Literal::s32(5), None).unwrap();
//! let out = service.execute(exe, &[arg], &ExecutionOptions::default()).unwrap();
//! assert_eq!(service.transfer_to_client(out.output, None).unwrap(), Literal::s32(6));
//! ```

pub mod backend;
mod buffer;
pub mod compile;
mod config;
mod error;
pub mod execution;
pub mod feed;
mod handle;
pub mod introspection;
mod options;
pub mod platform;
pub mod registry;
mod service;
pub mod transfer;
pub mod wire;

pub use buffer::DeviceBuffer;
pub use compile::{
    CacheStats, CompilationAdapter, CompilationCache, CompilationKey, CompilationStats, Compiler,
    Executable, HostCompiler,
};
pub use config::{CacheConfig, PlatformConfig, ServiceConfig};
pub use error::{ServiceError, ServiceResult, StatusCode};
pub use execution::{ExecuteResponse, ExecutionCoordinator, ExecutionPhase, ExecutionProfile};
pub use feed::{CancelToken, FeedQueue, FeedRegistry};
pub use handle::{
    ChannelHandle, ChannelKind, DeviceHandle, ExecutionHandle, ExecutionToken, GlobalDataHandle,
};
pub use introspection::{computation_graph_stats, GraphStats, ServiceStats};
pub use options::{
    DebugOptions, ExecutionOptions, PASS_CONSTANT_FOLDING, PASS_DEAD_CODE_ELIMINATION,
};
pub use platform::{Device, DeviceInfo, DriverError, HostPlatform, Platform};
pub use registry::{HandleRegistry, RegistryCounts};
pub use service::{ExecuteGraphRequest, Service};
pub use wire::{BatchResult, Request, Response};
