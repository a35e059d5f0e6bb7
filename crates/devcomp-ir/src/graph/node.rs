//! Computation nodes in the dataflow graph.

use serde::{Deserialize, Serialize};

use crate::error::IrError;
use crate::Shape;

use super::OpKind;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub op: OpKind,
    /// Indices of earlier nodes consumed by this one.
    #[serde(default)]
    pub operands: Vec<usize>,
    /// Declared result shape.
    pub shape: Shape,
    /// Optional label for debugging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl GraphNode {
    pub fn new(op: OpKind, operands: Vec<usize>, shape: Shape) -> Self {
        GraphNode {
            op,
            operands,
            shape,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Check that every operand refers to a node before `position`.
    pub fn validate_operands(&self, position: usize) -> Result<(), IrError> {
        for &operand in &self.operands {
            if operand >= position {
                return Err(IrError::InvalidOperand {
                    node: position,
                    operand,
                });
            }
        }
        if let Some(expected) = self.op.arity() {
            if expected != self.operands.len() {
                return Err(IrError::OperandCount {
                    op: self.op.name().to_string(),
                    expected,
                    actual: self.operands.len(),
                });
            }
        }
        Ok(())
    }

    pub fn parameter_index(&self) -> Option<usize> {
        match &self.op {
            OpKind::Parameter { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.op, OpKind::Constant { .. })
    }
}
