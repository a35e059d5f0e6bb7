//! Dataflow computation graphs.
//!
//! Nodes are stored in topological order: every operand index refers to an
//! earlier node. The graph result is the `root` node (the last node when no
//! root is set).

mod inference;
mod node;
pub mod optimization;
mod optype;

use serde::{Deserialize, Serialize};

pub use inference::infer_shape;
pub use node::GraphNode;
pub use optimization::{eliminate_dead_code, live_nodes};
pub use optype::{BinaryOp, OpKind, ReduceOp, UnaryOp};

use crate::error::IrError;
use crate::{Literal, Shape};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputationGraph {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<GraphNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<usize>,
}

impl ComputationGraph {
    pub fn new(name: impl Into<String>) -> Self {
        ComputationGraph {
            name: name.into(),
            nodes: Vec::new(),
            root: None,
        }
    }

    /// Append a node, inferring its shape from the operands.
    pub fn add_node(&mut self, op: OpKind, operands: Vec<usize>) -> Result<usize, IrError> {
        let position = self.nodes.len();
        for &operand in &operands {
            if operand >= position {
                return Err(IrError::InvalidOperand {
                    node: position,
                    operand,
                });
            }
        }
        let shapes: Vec<&Shape> = operands.iter().map(|&i| &self.nodes[i].shape).collect();
        let shape = infer_shape(&op, &shapes)?;
        self.nodes.push(GraphNode::new(op, operands, shape));
        Ok(position)
    }

    pub fn parameter(&mut self, index: usize, shape: Shape) -> Result<usize, IrError> {
        self.add_node(OpKind::Parameter { index, shape }, vec![])
    }

    pub fn constant(&mut self, literal: Literal) -> Result<usize, IrError> {
        self.add_node(OpKind::Constant { literal }, vec![])
    }

    pub fn unary(&mut self, op: UnaryOp, x: usize) -> Result<usize, IrError> {
        self.add_node(OpKind::Unary { op }, vec![x])
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: usize, rhs: usize) -> Result<usize, IrError> {
        self.add_node(OpKind::Binary { op }, vec![lhs, rhs])
    }

    pub fn reduce(&mut self, op: ReduceOp, axes: Vec<usize>, x: usize) -> Result<usize, IrError> {
        self.add_node(OpKind::Reduce { op, axes }, vec![x])
    }

    pub fn reshape(&mut self, dims: Vec<usize>, x: usize) -> Result<usize, IrError> {
        self.add_node(OpKind::Reshape { dims }, vec![x])
    }

    pub fn tuple(&mut self, elements: Vec<usize>) -> Result<usize, IrError> {
        self.add_node(OpKind::Tuple, elements)
    }

    pub fn get_tuple_element(&mut self, tuple: usize, index: usize) -> Result<usize, IrError> {
        self.add_node(OpKind::GetTupleElement { index }, vec![tuple])
    }

    pub fn infeed(&mut self, shape: Shape) -> Result<usize, IrError> {
        self.add_node(OpKind::Infeed { shape }, vec![])
    }

    pub fn outfeed(&mut self, x: usize) -> Result<usize, IrError> {
        self.add_node(OpKind::Outfeed, vec![x])
    }

    pub fn send(&mut self, channel: u64, x: usize) -> Result<usize, IrError> {
        self.add_node(OpKind::Send { channel }, vec![x])
    }

    pub fn recv(&mut self, channel: u64, shape: Shape) -> Result<usize, IrError> {
        self.add_node(OpKind::Recv { channel, shape }, vec![])
    }

    pub fn replica_id(&mut self) -> Result<usize, IrError> {
        self.add_node(OpKind::ReplicaId, vec![])
    }

    pub fn rng_uniform(&mut self, shape: Shape) -> Result<usize, IrError> {
        self.add_node(OpKind::RngUniform { shape }, vec![])
    }

    pub fn set_root(&mut self, index: usize) -> Result<(), IrError> {
        if index >= self.nodes.len() {
            return Err(IrError::RootOutOfBounds {
                index,
                len: self.nodes.len(),
            });
        }
        self.root = Some(index);
        Ok(())
    }

    pub fn root_index(&self) -> Result<usize, IrError> {
        if self.nodes.is_empty() {
            return Err(IrError::EmptyGraph);
        }
        let index = self.root.unwrap_or(self.nodes.len() - 1);
        if index >= self.nodes.len() {
            return Err(IrError::RootOutOfBounds {
                index,
                len: self.nodes.len(),
            });
        }
        Ok(index)
    }

    pub fn result_shape(&self) -> Result<&Shape, IrError> {
        Ok(&self.nodes[self.root_index()?].shape)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parameter shapes ordered by parameter index.
    ///
    /// Fails unless indices are exactly `0..n` with no duplicates.
    pub fn parameter_shapes(&self) -> Result<Vec<Shape>, IrError> {
        let mut params: Vec<(usize, &Shape)> = self
            .nodes
            .iter()
            .filter_map(|node| match &node.op {
                OpKind::Parameter { index, shape } => Some((*index, shape)),
                _ => None,
            })
            .collect();
        params.sort_by_key(|(index, _)| *index);
        for (position, (index, _)) in params.iter().enumerate() {
            if *index != position {
                return Err(IrError::ParameterNumbering(format!(
                    "expected parameter {} but found {}",
                    position, index
                )));
            }
        }
        Ok(params.into_iter().map(|(_, shape)| shape.clone()).collect())
    }

    /// Full structural validation, used for graphs received over the wire.
    pub fn validate(&self) -> Result<(), IrError> {
        self.root_index()?;
        for (position, node) in self.nodes.iter().enumerate() {
            node.validate_operands(position)?;
            let shapes: Vec<&Shape> = node
                .operands
                .iter()
                .map(|&i| &self.nodes[i].shape)
                .collect();
            let inferred = infer_shape(&node.op, &shapes).map_err(|e| IrError::NodeValidation {
                node: position,
                message: e.to_string(),
            })?;
            if !inferred.compatible(&node.shape) {
                return Err(IrError::NodeValidation {
                    node: position,
                    message: format!("declared shape {} but operation yields {}", node.shape, inferred),
                });
            }
            node.shape.validate()?;
        }
        self.parameter_shapes()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ElementType;

    fn add_one() -> ComputationGraph {
        let mut graph = ComputationGraph::new("add_one");
        let x = graph
            .parameter(0, Shape::scalar(ElementType::S32))
            .unwrap();
        let one = graph.constant(Literal::s32(1)).unwrap();
        graph.binary(BinaryOp::Add, x, one).unwrap();
        graph
    }

    #[test]
    fn test_builder_infers_shapes() {
        let graph = add_one();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(
            graph.result_shape().unwrap(),
            &Shape::scalar(ElementType::S32)
        );
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_forward_reference_rejected() {
        let mut graph = ComputationGraph::new("bad");
        let err = graph
            .add_node(OpKind::Unary { op: UnaryOp::Neg }, vec![0])
            .unwrap_err();
        assert_eq!(err, IrError::InvalidOperand { node: 0, operand: 0 });
    }

    #[test]
    fn test_validate_detects_tampered_shape() {
        let mut graph = add_one();
        graph.nodes[2].shape = Shape::array(ElementType::S32, vec![3]);
        assert!(matches!(
            graph.validate(),
            Err(IrError::NodeValidation { node: 2, .. })
        ));
    }

    #[test]
    fn test_parameter_numbering() {
        let mut graph = ComputationGraph::new("gap");
        graph.parameter(0, Shape::scalar(ElementType::F32)).unwrap();
        graph.parameter(2, Shape::scalar(ElementType::F32)).unwrap();
        assert!(matches!(
            graph.parameter_shapes(),
            Err(IrError::ParameterNumbering(_))
        ));
    }

    #[test]
    fn test_empty_graph() {
        let graph = ComputationGraph::new("empty");
        assert_eq!(graph.validate(), Err(IrError::EmptyGraph));
    }

    #[test]
    fn test_explicit_root() {
        let mut graph = add_one();
        graph.set_root(0).unwrap();
        assert_eq!(graph.root_index().unwrap(), 0);
        assert!(graph.set_root(9).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let graph = add_one();
        let json = serde_json::to_string(&graph).unwrap();
        let back: ComputationGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(graph, back);
    }

    #[test]
    fn test_json_round_trip_with_op_payloads() {
        let mut graph = ComputationGraph::new("mixed");
        let x = graph
            .parameter(0, Shape::array(ElementType::F32, vec![2, 3]))
            .unwrap();
        let e = graph.unary(UnaryOp::Exp, x).unwrap();
        let m = graph.binary(BinaryOp::Multiply, e, x).unwrap();
        graph.reduce(ReduceOp::Sum, vec![1], m).unwrap();

        let json = serde_json::to_string(&graph).unwrap();
        assert!(json.contains("\"kind\":\"unary\""));
        assert!(json.contains("\"op\":\"exp\""));
        let back: ComputationGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(graph, back);
        assert_eq!(
            back.result_shape().unwrap(),
            &Shape::array(ElementType::F32, vec![2])
        );
    }
}
