//! Benchmarks for handle bookkeeping and cached execution.
//!
//! Run with: cargo bench -p devcomp-service

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use devcomp_ir::{BinaryOp, ComputationGraph, ElementType, Literal, Shape};
use devcomp_service::{ExecutionOptions, Service, ServiceConfig};
use std::hint::black_box;

fn chain(length: usize) -> ComputationGraph {
    let mut graph = ComputationGraph::new(format!("chain_{}", length));
    let mut current = graph
        .parameter(0, Shape::array(ElementType::F32, vec![64]))
        .unwrap();
    let one = graph.constant(Literal::f32(1.0)).unwrap();
    for _ in 0..length {
        current = graph.binary(BinaryOp::Add, current, one).unwrap();
    }
    graph
}

fn bench_transfers(c: &mut Criterion) {
    let service = Service::new(ServiceConfig::default()).unwrap();
    let mut group = c.benchmark_group("transfer");
    for size in [16usize, 256, 4096].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let literal = Literal::vector(ElementType::F32, &vec![0.5; size]);
            b.iter(|| {
                let handle = service
                    .transfer_to_server(black_box(literal.clone()), None)
                    .unwrap();
                service.unregister(&[handle]).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_cached_execution(c: &mut Criterion) {
    let service = Service::new(ServiceConfig::default()).unwrap();
    let arg = service
        .transfer_to_server(Literal::vector(ElementType::F32, &[1.0; 64]), None)
        .unwrap();
    let options = ExecutionOptions::default();
    let mut group = c.benchmark_group("execute_graph");
    for length in [4usize, 16, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(length), length, |b, &length| {
            let graph = chain(length);
            b.iter(|| {
                let response = service.execute_graph(&graph, &[arg], &options).unwrap();
                service.unregister(&[response.output]).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_transfers, bench_cached_execution);
criterion_main!(benches);
