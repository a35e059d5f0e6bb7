//! Error types for the IR.

use thiserror::Error;

use crate::ElementType;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrError {
    #[error("Graph has no nodes")]
    EmptyGraph,
    #[error("Root index {index} out of bounds (graph has {len} nodes)")]
    RootOutOfBounds { index: usize, len: usize },
    #[error("Node {node}: operand {operand} does not refer to an earlier node")]
    InvalidOperand { node: usize, operand: usize },
    #[error("Operation {op} expects {expected} operand(s), got {actual}")]
    OperandCount {
        op: String,
        expected: usize,
        actual: usize,
    },
    #[error("Cannot infer shape of {op}: {reason}")]
    ShapeInference { op: String, reason: String },
    #[error("Node {node}: {message}")]
    NodeValidation { node: usize, message: String },
    #[error("Parameter numbering is invalid: {0}")]
    ParameterNumbering(String),
    #[error("Element count mismatch: expected {expected}, got {actual}")]
    ElementCountMismatch { expected: usize, actual: usize },
    #[error("Element type mismatch: expected {expected}, got {actual}")]
    ElementTypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },
    #[error("Layout {minor_to_major:?} is not a permutation of 0..{rank}")]
    InvalidLayout {
        rank: usize,
        minor_to_major: Vec<usize>,
    },
    #[error("Incompatible layout: {0}")]
    LayoutMismatch(String),
    #[error("Shape {0} is too large to address")]
    ShapeTooLarge(String),
}
