//! One-shot subcommands.

use anyhow::{Context, Result};
use devcomp_ir::{ComputationGraph, Literal};
use devcomp_service::{DebugOptions, ExecutionOptions, Service};
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}: {}", what, path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}: {}", what, path.display()))
}

pub fn load_graph(path: &Path) -> Result<ComputationGraph> {
    read_json(path, "graph")
}

pub fn devices<W: Write>(service: &Service, mut out: W) -> Result<()> {
    for device in service.devices() {
        writeln!(out, "{}", serde_json::to_string(&device)?)?;
    }
    Ok(())
}

pub fn stats<W: Write>(service: &Service, graph: &Path, mut out: W) -> Result<()> {
    let graph = load_graph(graph)?;
    let stats = service
        .computation_graph_stats(&graph, &DebugOptions::default())
        .with_context(|| format!("Invalid graph {}", graph.name))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&stats)?)?;
    Ok(())
}

/// Upload the arguments, run the graph once and print the result literal
/// (one line per replica when several run).
pub fn run<W: Write>(
    service: &Service,
    graph: &Path,
    args: &[PathBuf],
    seed: Option<u64>,
    replicas: usize,
    mut out: W,
) -> Result<()> {
    let graph = load_graph(graph)?;
    let mut handles = Vec::with_capacity(args.len());
    for path in args {
        let literal: Literal = read_json(path, "argument")?;
        let handle = service
            .transfer_to_server(literal, None)
            .with_context(|| format!("Failed to upload {}", path.display()))?;
        handles.push(handle);
    }

    let mut options = ExecutionOptions::default().with_replicas(replicas);
    if let Some(seed) = seed {
        options = options.with_seed(seed);
    }
    if replicas > 1 {
        options = options.with_per_replica_results();
    }
    let response = service
        .execute_graph(&graph, &handles, &options)
        .with_context(|| format!("Execution of {} failed", graph.name))?;

    let outputs = if response.replica_outputs.is_empty() {
        vec![response.output]
    } else {
        response.replica_outputs.clone()
    };
    for handle in &outputs {
        let literal = service.transfer_to_client(*handle, None)?;
        writeln!(out, "{}", serde_json::to_string(&literal)?)?;
    }
    tracing::info!(
        graph = %graph.name,
        replicas,
        compute_time_us = response.profile.compute_time_us,
        "run finished"
    );
    service.unregister(&outputs)?;
    service.unregister(&handles)?;
    Ok(())
}
