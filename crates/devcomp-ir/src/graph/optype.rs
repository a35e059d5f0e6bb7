//! Operation kinds for graph nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Literal, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Tanh,
    Sigmoid,
    Relu,
}

impl UnaryOp {
    /// Whether the op is counted as a transcendental by cost analysis.
    pub fn is_transcendental(self) -> bool {
        matches!(
            self,
            UnaryOp::Exp | UnaryOp::Log | UnaryOp::Sqrt | UnaryOp::Tanh | UnaryOp::Sigmoid
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Power,
    // Comparisons produce `pred` arrays
    Eq,
    Lt,
    Gt,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::Lt | BinaryOp::Gt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Product,
    Max,
    Min,
    Mean,
}

/// Operation performed by a node.
///
/// `Infeed`, `Outfeed`, `Send` and `Recv` interact with replica-scoped queues
/// and channels at run time and are never removed by optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// Positional argument of the computation.
    Parameter { index: usize, shape: Shape },
    Constant { literal: Literal },
    Unary { op: UnaryOp },
    /// Element-wise binary op; a rank-0 operand broadcasts.
    Binary { op: BinaryOp },
    Reduce { op: ReduceOp, axes: Vec<usize> },
    Reshape { dims: Vec<usize> },
    Tuple,
    GetTupleElement { index: usize },
    /// Dequeue a value from the replica's infeed queue.
    Infeed { shape: Shape },
    /// Enqueue the operand on the replica's outfeed queue.
    Outfeed,
    /// Push the operand into a cross-execution channel.
    Send { channel: u64 },
    /// Pop a value from a cross-execution channel.
    Recv { channel: u64, shape: Shape },
    /// Index of the executing replica as a `u32` scalar.
    ReplicaId,
    /// Uniform samples in `[0, 1)` drawn from the execution seed.
    RngUniform { shape: Shape },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Parameter { .. } => "parameter",
            OpKind::Constant { .. } => "constant",
            OpKind::Unary { .. } => "unary",
            OpKind::Binary { .. } => "binary",
            OpKind::Reduce { .. } => "reduce",
            OpKind::Reshape { .. } => "reshape",
            OpKind::Tuple => "tuple",
            OpKind::GetTupleElement { .. } => "get_tuple_element",
            OpKind::Infeed { .. } => "infeed",
            OpKind::Outfeed => "outfeed",
            OpKind::Send { .. } => "send",
            OpKind::Recv { .. } => "recv",
            OpKind::ReplicaId => "replica_id",
            OpKind::RngUniform { .. } => "rng_uniform",
        }
    }

    /// Nodes with effects outside their result value.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            OpKind::Infeed { .. } | OpKind::Outfeed | OpKind::Send { .. } | OpKind::Recv { .. }
        )
    }

    /// Fixed operand count, or `None` for variadic ops.
    pub fn arity(&self) -> Option<usize> {
        match self {
            OpKind::Parameter { .. }
            | OpKind::Constant { .. }
            | OpKind::Infeed { .. }
            | OpKind::Recv { .. }
            | OpKind::ReplicaId
            | OpKind::RngUniform { .. } => Some(0),
            OpKind::Unary { .. }
            | OpKind::Reduce { .. }
            | OpKind::Reshape { .. }
            | OpKind::GetTupleElement { .. }
            | OpKind::Outfeed
            | OpKind::Send { .. } => Some(1),
            OpKind::Binary { .. } => Some(2),
            OpKind::Tuple => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Parameter { index, shape } => write!(f, "parameter({}) {}", index, shape),
            OpKind::Constant { literal } => write!(f, "constant {}", literal),
            OpKind::Unary { op } => write!(f, "{:?}", op),
            OpKind::Binary { op } => write!(f, "{:?}", op),
            OpKind::Reduce { op, axes } => write!(f, "reduce_{:?}{:?}", op, axes),
            OpKind::Reshape { dims } => write!(f, "reshape{:?}", dims),
            OpKind::GetTupleElement { index } => write!(f, "get_tuple_element({})", index),
            OpKind::Send { channel } => write!(f, "send(channel={})", channel),
            OpKind::Recv { channel, shape } => write!(f, "recv(channel={}) {}", channel, shape),
            other => f.write_str(other.name()),
        }
    }
}
