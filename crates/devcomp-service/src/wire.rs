//! Request/response messages for driving a [`Service`] over a byte stream.
//!
//! Both enums are internally tagged JSON objects, for example
//! `{"request":"get_shape","handle":7}`. Failures travel as
//! [`Response::Error`] carrying a [`StatusCode`].

use devcomp_ir::{ComputationGraph, Literal, Shape};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult, StatusCode};
use crate::execution::{ExecuteResponse, ExecutionPhase};
use crate::handle::{
    ChannelHandle, ChannelKind, DeviceHandle, ExecutionHandle, ExecutionToken, GlobalDataHandle,
};
use crate::introspection::{GraphStats, ServiceStats};
use crate::options::{DebugOptions, ExecutionOptions};
use crate::platform::DeviceInfo;
use crate::service::{ExecuteGraphRequest, Service};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    Compile {
        graph: ComputationGraph,
        #[serde(default)]
        options: ExecutionOptions,
    },
    Execute {
        handle: ExecutionHandle,
        #[serde(default)]
        arguments: Vec<GlobalDataHandle>,
        #[serde(default)]
        options: ExecutionOptions,
    },
    ExecuteAsync {
        handle: ExecutionHandle,
        #[serde(default)]
        arguments: Vec<GlobalDataHandle>,
        #[serde(default)]
        options: ExecutionOptions,
    },
    WaitForExecution {
        token: ExecutionToken,
    },
    ReleaseExecution {
        token: ExecutionToken,
    },
    CancelExecution {
        token: ExecutionToken,
    },
    ExecuteGraph {
        graph: ComputationGraph,
        #[serde(default)]
        arguments: Vec<GlobalDataHandle>,
        #[serde(default)]
        options: ExecutionOptions,
    },
    ExecuteGraphParallel {
        requests: Vec<ExecuteGraphRequest>,
    },
    TransferToServer {
        literal: Literal,
        #[serde(default)]
        device: Option<DeviceHandle>,
    },
    TransferToClient {
        handle: GlobalDataHandle,
        #[serde(default)]
        shape: Option<Shape>,
    },
    TransferToInfeed {
        literal: Literal,
        #[serde(default)]
        replica_id: u32,
        #[serde(default)]
        device: Option<DeviceHandle>,
    },
    TransferFromOutfeed {
        shape: Shape,
        #[serde(default)]
        replica_id: u32,
        #[serde(default)]
        device: Option<DeviceHandle>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Unregister {
        handles: Vec<GlobalDataHandle>,
    },
    DeconstructTuple {
        handle: GlobalDataHandle,
    },
    Unpack {
        handle: GlobalDataHandle,
    },
    GetDeviceHandles {
        count: usize,
    },
    ListDevices,
    CreateChannelHandle {
        #[serde(default)]
        kind: ChannelKind,
    },
    GetShape {
        handle: GlobalDataHandle,
    },
    ComputationGraphStats {
        graph: ComputationGraph,
        #[serde(default)]
        debug_options: DebugOptions,
    },
    ResetDevice {
        device: DeviceHandle,
    },
    ReleaseExecutable {
        handle: ExecutionHandle,
    },
    ServiceStats,
}

impl Request {
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Wire name of the request, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Compile { .. } => "compile",
            Request::Execute { .. } => "execute",
            Request::ExecuteAsync { .. } => "execute_async",
            Request::WaitForExecution { .. } => "wait_for_execution",
            Request::ReleaseExecution { .. } => "release_execution",
            Request::CancelExecution { .. } => "cancel_execution",
            Request::ExecuteGraph { .. } => "execute_graph",
            Request::ExecuteGraphParallel { .. } => "execute_graph_parallel",
            Request::TransferToServer { .. } => "transfer_to_server",
            Request::TransferToClient { .. } => "transfer_to_client",
            Request::TransferToInfeed { .. } => "transfer_to_infeed",
            Request::TransferFromOutfeed { .. } => "transfer_from_outfeed",
            Request::Unregister { .. } => "unregister",
            Request::DeconstructTuple { .. } => "deconstruct_tuple",
            Request::Unpack { .. } => "unpack",
            Request::GetDeviceHandles { .. } => "get_device_handles",
            Request::ListDevices => "list_devices",
            Request::CreateChannelHandle { .. } => "create_channel_handle",
            Request::GetShape { .. } => "get_shape",
            Request::ComputationGraphStats { .. } => "computation_graph_stats",
            Request::ResetDevice { .. } => "reset_device",
            Request::ReleaseExecutable { .. } => "release_executable",
            Request::ServiceStats => "service_stats",
        }
    }
}

/// Outcome of one entry of a parallel batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchResult {
    Ok { result: ExecuteResponse },
    Error { code: StatusCode, message: String },
}

impl From<ServiceResult<ExecuteResponse>> for BatchResult {
    fn from(result: ServiceResult<ExecuteResponse>) -> Self {
        match result {
            Ok(result) => BatchResult::Ok { result },
            Err(err) => BatchResult::Error {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Executable { handle: ExecutionHandle },
    Executed { result: ExecuteResponse },
    Token { token: ExecutionToken },
    Phase { phase: ExecutionPhase },
    Batch { results: Vec<BatchResult> },
    Data { handle: GlobalDataHandle },
    DataList { handles: Vec<GlobalDataHandle> },
    Literal { literal: Literal },
    Devices { handles: Vec<DeviceHandle> },
    DeviceInfo { devices: Vec<DeviceInfo> },
    Channel { handle: ChannelHandle },
    Shape { shape: Shape },
    GraphStats { stats: GraphStats },
    ServiceStats { stats: ServiceStats },
    Reset { invalidated: usize },
    Error { code: StatusCode, message: String },
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    /// Serialize to a single JSON line.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(
                "{{\"response\":\"error\",\"code\":\"InvalidArgument\",\"message\":{:?}}}",
                err.to_string()
            )
        })
    }
}

impl From<ServiceError> for Response {
    fn from(err: ServiceError) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl Service {
    /// Run one request. Never fails: errors become [`Response::Error`].
    pub fn handle(&self, request: Request) -> Response {
        let name = request.name();
        match self.dispatch(request) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(request = name, code = %err.code(), error = %err, "request failed");
                err.into()
            }
        }
    }

    /// Decode a JSON request line and run it. A line that does not decode
    /// yields an `InvalidArgument` error response.
    pub fn handle_line(&self, line: &str) -> Response {
        match Request::from_json(line) {
            Ok(request) => {
                tracing::debug!(request = request.name(), "received request");
                self.handle(request)
            }
            Err(err) => {
                tracing::warn!(error = %err, "malformed request");
                Response::Error {
                    code: StatusCode::InvalidArgument,
                    message: format!("malformed request: {}", err),
                }
            }
        }
    }

    /// Like [`Service::handle_line`], with the response encoded as JSON.
    pub fn handle_json(&self, line: &str) -> String {
        self.handle_line(line).to_json()
    }

    fn dispatch(&self, request: Request) -> ServiceResult<Response> {
        let response = match request {
            Request::Compile { graph, options } => Response::Executable {
                handle: self.compile(&graph, &options)?,
            },
            Request::Execute {
                handle,
                arguments,
                options,
            } => Response::Executed {
                result: self.execute(handle, &arguments, &options)?,
            },
            Request::ExecuteAsync {
                handle,
                arguments,
                options,
            } => Response::Token {
                token: self.execute_async(handle, &arguments, &options)?,
            },
            Request::WaitForExecution { token } => Response::Executed {
                result: self.wait_for_execution(token)?,
            },
            Request::ReleaseExecution { token } => {
                self.release_execution(token)?;
                Response::Ack
            }
            Request::CancelExecution { token } => Response::Phase {
                phase: self.cancel_execution(token)?,
            },
            Request::ExecuteGraph {
                graph,
                arguments,
                options,
            } => Response::Executed {
                result: self.execute_graph(&graph, &arguments, &options)?,
            },
            Request::ExecuteGraphParallel { requests } => Response::Batch {
                results: self
                    .execute_graph_parallel(&requests)
                    .into_iter()
                    .map(BatchResult::from)
                    .collect(),
            },
            Request::TransferToServer { literal, device } => Response::Data {
                handle: self.transfer_to_server(literal, device)?,
            },
            Request::TransferToClient { handle, shape } => Response::Literal {
                literal: self.transfer_to_client(handle, shape.as_ref())?,
            },
            Request::TransferToInfeed {
                literal,
                replica_id,
                device,
            } => {
                self.transfer_to_infeed(literal, replica_id, device)?;
                Response::Ack
            }
            Request::TransferFromOutfeed {
                shape,
                replica_id,
                device,
                timeout_ms,
            } => Response::Literal {
                literal: self.transfer_from_outfeed(
                    &shape,
                    replica_id,
                    device,
                    timeout_ms.map(Duration::from_millis),
                )?,
            },
            Request::Unregister { handles } => {
                self.unregister(&handles)?;
                Response::Ack
            }
            Request::DeconstructTuple { handle } => Response::DataList {
                handles: self.deconstruct_tuple(handle)?,
            },
            Request::Unpack { handle } => Response::DataList {
                handles: self.unpack(handle)?,
            },
            Request::GetDeviceHandles { count } => Response::Devices {
                handles: self.get_device_handles(count)?,
            },
            Request::ListDevices => Response::DeviceInfo {
                devices: self.devices(),
            },
            Request::CreateChannelHandle { kind } => Response::Channel {
                handle: self.create_channel_handle(kind),
            },
            Request::GetShape { handle } => Response::Shape {
                shape: self.get_shape(handle)?,
            },
            Request::ComputationGraphStats {
                graph,
                debug_options,
            } => Response::GraphStats {
                stats: self.computation_graph_stats(&graph, &debug_options)?,
            },
            Request::ResetDevice { device } => Response::Reset {
                invalidated: self.reset_device(device)?,
            },
            Request::ReleaseExecutable { handle } => {
                self.release_executable(handle)?;
                Response::Ack
            }
            Request::ServiceStats => Response::ServiceStats {
                stats: self.service_stats(),
            },
        };
        Ok(response)
    }
}
