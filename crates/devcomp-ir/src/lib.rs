//! # devcomp-ir
//!
//! Value and graph model shared by the devcomp service and its clients.
//!
//! - [`ElementType`], [`Shape`] and [`Layout`]: static type descriptors of
//!   device-resident values
//! - [`Literal`]: host-representable values used for transfers
//! - [`ComputationGraph`]: serialized dataflow graphs submitted for
//!   compilation, with shape inference and structural validation
//!
//! Everything here is plain data with serde support so it can cross the
//! service boundary unchanged.

mod element;
mod error;
pub mod graph;
mod literal;
mod shape;

pub use element::ElementType;
pub use error::IrError;
pub use graph::{
    eliminate_dead_code, infer_shape, BinaryOp, ComputationGraph, GraphNode, OpKind, ReduceOp,
    UnaryOp,
};
pub use literal::Literal;
pub use shape::{Layout, Shape};
