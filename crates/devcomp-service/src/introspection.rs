//! Static graph analysis and service-wide statistics.

use devcomp_ir::{ComputationGraph, OpKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::compile::CacheStats;
use crate::error::ServiceResult;
use crate::options::DebugOptions;
use crate::registry::RegistryCounts;

/// Static cost summary of a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub parameter_count: usize,
    /// Elementwise arithmetic and reduction operations.
    pub flop_count: u64,
    pub transcendental_count: u64,
    /// Size of the result in device memory.
    pub output_bytes: usize,
    pub side_effect_count: usize,
    /// Node count per operation name.
    pub op_histogram: BTreeMap<String, usize>,
}

/// Analyse a graph without compiling or running it.
pub fn computation_graph_stats(
    graph: &ComputationGraph,
    debug_options: &DebugOptions,
) -> ServiceResult<GraphStats> {
    graph.validate()?;
    let mut stats = GraphStats {
        node_count: graph.node_count(),
        parameter_count: graph.parameter_shapes()?.len(),
        output_bytes: graph.result_shape()?.byte_size(),
        ..GraphStats::default()
    };

    for node in &graph.nodes {
        *stats
            .op_histogram
            .entry(node.op.name().to_string())
            .or_default() += 1;
        let elements = node.shape.element_count() as u64;
        match &node.op {
            OpKind::Unary { op } => {
                stats.flop_count = stats.flop_count.saturating_add(elements);
                if op.is_transcendental() {
                    stats.transcendental_count =
                        stats.transcendental_count.saturating_add(elements);
                }
            }
            OpKind::Binary { op } => {
                stats.flop_count = stats.flop_count.saturating_add(elements);
                if *op == devcomp_ir::BinaryOp::Power {
                    stats.transcendental_count =
                        stats.transcendental_count.saturating_add(elements);
                }
            }
            OpKind::Reduce { .. } => {
                let input = node
                    .operands
                    .first()
                    .map(|&i| graph.nodes[i].shape.element_count() as u64)
                    .unwrap_or(0);
                stats.flop_count = stats.flop_count.saturating_add(input);
            }
            op if op.has_side_effects() => stats.side_effect_count += 1,
            _ => {}
        }
    }

    if debug_options.verbose_compile || debug_options.dump_to.is_some() {
        tracing::debug!(
            graph = %graph.name,
            nodes = stats.node_count,
            flops = stats.flop_count,
            dump_to = ?debug_options.dump_to,
            "graph statistics"
        );
    }
    Ok(stats)
}

/// Snapshot of live resources and cache behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub handles: RegistryCounts,
    pub executions_tracked: usize,
    pub executions_in_flight: usize,
    pub cache: CacheStats,
}
