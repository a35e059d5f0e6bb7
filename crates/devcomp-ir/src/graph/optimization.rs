//! Graph-level rewrites that need no evaluation.

use crate::error::IrError;

use super::{ComputationGraph, OpKind};

/// Mark nodes that contribute to the root or have side effects.
///
/// Parameters always stay live so the calling convention is preserved.
pub fn live_nodes(graph: &ComputationGraph) -> Result<Vec<bool>, IrError> {
    let root = graph.root_index()?;
    let mut live = vec![false; graph.nodes.len()];
    let mut stack = vec![root];
    for (index, node) in graph.nodes.iter().enumerate() {
        if node.op.has_side_effects() || matches!(node.op, OpKind::Parameter { .. }) {
            stack.push(index);
        }
    }
    while let Some(index) = stack.pop() {
        if live[index] {
            continue;
        }
        live[index] = true;
        stack.extend(graph.nodes[index].operands.iter().copied());
    }
    Ok(live)
}

/// Remove nodes that are not live, returning the new graph and the number
/// of nodes removed.
pub fn eliminate_dead_code(graph: &ComputationGraph) -> Result<(ComputationGraph, usize), IrError> {
    let live = live_nodes(graph)?;
    let root = graph.root_index()?;
    let mut remap = vec![usize::MAX; graph.nodes.len()];
    let mut out = ComputationGraph::new(graph.name.clone());

    for (index, node) in graph.nodes.iter().enumerate() {
        if !live[index] {
            continue;
        }
        let mut node = node.clone();
        node.operands = node.operands.iter().map(|&op| remap[op]).collect();
        remap[index] = out.nodes.len();
        out.nodes.push(node);
    }

    let removed = graph.nodes.len() - out.nodes.len();
    out.root = Some(remap[root]);
    Ok((out, removed))
}
