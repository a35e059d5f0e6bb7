//! Error taxonomy of the service.

use devcomp_ir::IrError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Invalid handle {handle}: {reason}")]
    InvalidHandle { handle: u64, reason: String },

    #[error("Invalid execution token {0}")]
    InvalidToken(u64),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Layout error: {0}")]
    LayoutError(String),

    #[error("Compile error: {0}")]
    CompileError(String),

    #[error("Transfer error: {0}")]
    TransferError(String),

    #[error("Timed out after {elapsed_ms}ms waiting for {what}")]
    Timeout { what: String, elapsed_ms: u64 },

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Handle {0} does not hold a tuple")]
    NotATuple(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ServiceError {
    pub fn invalid_handle(handle: u64, reason: impl Into<String>) -> Self {
        ServiceError::InvalidHandle {
            handle,
            reason: reason.into(),
        }
    }

    /// Wire status code for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidHandle { .. } => StatusCode::InvalidHandle,
            ServiceError::InvalidToken(_) => StatusCode::InvalidToken,
            ServiceError::ShapeMismatch(_) => StatusCode::ShapeMismatch,
            ServiceError::LayoutError(_) => StatusCode::LayoutError,
            ServiceError::CompileError(_) => StatusCode::CompileError,
            ServiceError::TransferError(_) => StatusCode::TransferError,
            ServiceError::Timeout { .. } => StatusCode::Timeout,
            ServiceError::DeviceError(_) => StatusCode::DeviceError,
            ServiceError::Cancelled => StatusCode::Cancelled,
            ServiceError::NotATuple(_) => StatusCode::NotATuple,
            ServiceError::InvalidArgument(_) => StatusCode::InvalidArgument,
        }
    }

    /// Map an IR error raised while compiling.
    pub fn compile(err: IrError) -> Self {
        ServiceError::CompileError(err.to_string())
    }
}

impl From<IrError> for ServiceError {
    fn from(err: IrError) -> Self {
        ServiceError::InvalidArgument(err.to_string())
    }
}

/// Status code carried by failed wire responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    InvalidHandle,
    InvalidToken,
    ShapeMismatch,
    LayoutError,
    CompileError,
    TransferError,
    Timeout,
    DeviceError,
    Cancelled,
    NotATuple,
    InvalidArgument,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
