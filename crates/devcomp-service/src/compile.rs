//! Compilation adapter: turns graphs into executables.
//!
//! The [`Compiler`] trait is the seam to a lowering pipeline; the
//! [`HostCompiler`] validates, applies layouts and runs graph passes for
//! the host platform. [`CompilationAdapter`] puts a content-addressed,
//! single-flight [`CompilationCache`] in front of it and registers the
//! results.

use devcomp_ir::{eliminate_dead_code, ComputationGraph, Literal, OpKind, Shape};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::evaluate_pure;
use crate::error::{ServiceError, ServiceResult};
use crate::handle::{DeviceHandle, ExecutionHandle};
use crate::options::{ExecutionOptions, PASS_CONSTANT_FOLDING, PASS_DEAD_CODE_ELIMINATION};
use crate::registry::HandleRegistry;

/// Statistics about one compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationStats {
    pub compilation_time: Duration,
    pub original_nodes: usize,
    pub optimized_nodes: usize,
    pub constants_folded: usize,
    pub dead_nodes_eliminated: usize,
    pub passes_run: Vec<String>,
}

/// A compiled, runnable program.
#[derive(Debug, Clone)]
pub struct Executable {
    pub program: ComputationGraph,
    /// Parameter shapes with their layouts, in parameter order.
    pub parameter_shapes: Vec<Shape>,
    /// Result shape; layouts are present only where one was requested.
    pub result_shape: Shape,
    pub num_replicas: usize,
    /// Devices requested at compile time, one per replica. Empty when the
    /// service should choose.
    pub device_assignment: Vec<DeviceHandle>,
    pub stats: CompilationStats,
}

impl Executable {
    /// Channel ids referenced by send and receive nodes.
    pub fn channel_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .program
            .nodes
            .iter()
            .filter_map(|node| match node.op {
                OpKind::Send { channel } | OpKind::Recv { channel, .. } => Some(channel),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} params -> {} ({} nodes, {} replicas)",
            self.program.name,
            self.parameter_shapes.len(),
            self.result_shape,
            self.program.node_count(),
            self.num_replicas
        )
    }
}

/// Lowers a graph into an [`Executable`].
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        graph: &ComputationGraph,
        options: &ExecutionOptions,
    ) -> ServiceResult<Executable>;
}

/// Compiler for the host platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCompiler;

impl HostCompiler {
    pub fn new() -> Self {
        HostCompiler
    }
}

impl Compiler for HostCompiler {
    fn compile(
        &self,
        graph: &ComputationGraph,
        options: &ExecutionOptions,
    ) -> ServiceResult<Executable> {
        let start = Instant::now();
        graph.validate().map_err(ServiceError::compile)?;

        if options.num_replicas == 0 {
            return Err(ServiceError::InvalidArgument(
                "num_replicas must be at least 1".to_string(),
            ));
        }
        if !options.device_handles.is_empty() && options.device_handles.len() != options.num_replicas
        {
            return Err(ServiceError::InvalidArgument(format!(
                "{} devices assigned for {} replicas",
                options.device_handles.len(),
                options.num_replicas
            )));
        }

        let mut parameter_shapes: Vec<Shape> = graph
            .parameter_shapes()
            .map_err(ServiceError::compile)?
            .iter()
            .map(Shape::normalized)
            .collect();
        apply_argument_layouts(&mut parameter_shapes, &options.argument_layouts)?;

        let inferred_result = graph.result_shape().map_err(ServiceError::compile)?;
        let result_shape = match &options.result_layout {
            Some(layout) => {
                if !layout.compatible(inferred_result) {
                    return Err(ServiceError::CompileError(format!(
                        "result layout {} conflicts with result shape {}",
                        layout, inferred_result
                    )));
                }
                layout.validate().map_err(ServiceError::compile)?;
                layout.clone()
            }
            None => inferred_result.clone(),
        };

        let debug_options = &options.debug_options;
        let mut program = graph.clone();
        let mut stats = CompilationStats {
            original_nodes: graph.node_count(),
            ..CompilationStats::default()
        };
        if debug_options.pass_enabled(PASS_CONSTANT_FOLDING) {
            stats.constants_folded = fold_constants(&mut program);
            stats.passes_run.push(PASS_CONSTANT_FOLDING.to_string());
        }
        if debug_options.pass_enabled(PASS_DEAD_CODE_ELIMINATION) {
            let (optimized, removed) =
                eliminate_dead_code(&program).map_err(ServiceError::compile)?;
            program = optimized;
            stats.dead_nodes_eliminated = removed;
            stats.passes_run.push(PASS_DEAD_CODE_ELIMINATION.to_string());
        }
        stats.optimized_nodes = program.node_count();
        stats.compilation_time = start.elapsed();

        if debug_options.verbose_compile {
            tracing::info!(
                graph = %graph.name,
                original_nodes = stats.original_nodes,
                optimized_nodes = stats.optimized_nodes,
                folded = stats.constants_folded,
                passes = ?stats.passes_run,
                "compiled graph"
            );
        }
        if let Some(dump_to) = &debug_options.dump_to {
            tracing::debug!(
                graph = %graph.name,
                dump_to = %dump_to,
                as_text = debug_options.dump_graph_as_text,
                timestamp = debug_options.dump_include_timestamp,
                "graph dump requested"
            );
        }

        Ok(Executable {
            program,
            parameter_shapes,
            result_shape,
            num_replicas: options.num_replicas,
            device_assignment: options.device_handles.clone(),
            stats,
        })
    }
}

fn apply_argument_layouts(parameters: &mut [Shape], layouts: &[Shape]) -> ServiceResult<()> {
    if layouts.is_empty() {
        return Ok(());
    }
    if layouts.len() != parameters.len() {
        return Err(ServiceError::CompileError(format!(
            "{} argument layouts given for {} parameters",
            layouts.len(),
            parameters.len()
        )));
    }
    for (index, (parameter, layout)) in parameters.iter_mut().zip(layouts).enumerate() {
        if !layout.compatible(parameter) {
            return Err(ServiceError::CompileError(format!(
                "layout conflict for parameter {}: requested {} but parameter is {}",
                index, layout, parameter
            )));
        }
        layout.validate().map_err(ServiceError::compile)?;
        *parameter = layout.normalized();
    }
    Ok(())
}

/// Replace pure nodes whose operands are all constants with their value.
///
/// Nodes whose evaluation fails are left alone so the failure surfaces at
/// run time.
fn fold_constants(program: &mut ComputationGraph) -> usize {
    let mut folded = 0;
    for index in 0..program.nodes.len() {
        let node = &program.nodes[index];
        let pure = matches!(
            node.op,
            OpKind::Unary { .. }
                | OpKind::Binary { .. }
                | OpKind::Reduce { .. }
                | OpKind::Reshape { .. }
                | OpKind::Tuple
                | OpKind::GetTupleElement { .. }
        );
        if !pure || node.operands.is_empty() {
            continue;
        }
        let operands: Vec<&Literal> = node
            .operands
            .iter()
            .filter_map(|&i| match &program.nodes[i].op {
                OpKind::Constant { literal } => Some(literal),
                _ => None,
            })
            .collect();
        if operands.len() != node.operands.len() {
            continue;
        }
        let Ok(literal) = evaluate_pure(&node.op, &operands) else {
            continue;
        };
        let node = &mut program.nodes[index];
        node.op = OpKind::Constant { literal };
        node.operands.clear();
        folded += 1;
    }
    folded
}

/// Collects the exact content of a compilation request.
#[derive(Default)]
struct ContentWriter {
    bytes: Vec<u8>,
}

impl Hasher for ContentWriter {
    fn write(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn finish(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(&self.bytes);
        hasher.finish()
    }
}

fn write_literal(literal: &Literal, out: &mut ContentWriter) {
    match literal {
        Literal::Array {
            element_type,
            dims,
            layout,
            values,
        } => {
            "array".hash(out);
            element_type.hash(out);
            dims.hash(out);
            layout.hash(out);
            values.len().hash(out);
            for value in values {
                value.to_bits().hash(out);
            }
        }
        Literal::Tuple { elements } => {
            "tuple".hash(out);
            elements.len().hash(out);
            for element in elements {
                write_literal(element, out);
            }
        }
    }
}

fn write_op(op: &OpKind, out: &mut ContentWriter) {
    op.name().hash(out);
    match op {
        OpKind::Parameter { index, shape } => {
            index.hash(out);
            shape.hash(out);
        }
        OpKind::Constant { literal } => write_literal(literal, out),
        OpKind::Unary { op } => op.hash(out),
        OpKind::Binary { op } => op.hash(out),
        OpKind::Reduce { op, axes } => {
            op.hash(out);
            axes.hash(out);
        }
        OpKind::Reshape { dims } => dims.hash(out),
        OpKind::GetTupleElement { index } => index.hash(out),
        OpKind::Infeed { shape } | OpKind::RngUniform { shape } => shape.hash(out),
        OpKind::Send { channel } => channel.hash(out),
        OpKind::Recv { channel, shape } => {
            channel.hash(out);
            shape.hash(out);
        }
        OpKind::Tuple | OpKind::Outfeed | OpKind::ReplicaId => {}
    }
}

/// Cache key for a (graph, options) pair.
///
/// Hashing uses a fingerprint; equality compares the full content, so two
/// requests only share an executable when they are identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationKey {
    fingerprint: u64,
    content: Vec<u8>,
}

impl Hash for CompilationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint);
    }
}

impl CompilationKey {
    /// Key over the graph and the compile-relevant options.
    ///
    /// Seeds and dump settings are excluded: they do not change the
    /// executable.
    pub fn new(graph: &ComputationGraph, options: &ExecutionOptions) -> Self {
        let mut out = ContentWriter::default();
        graph.name.hash(&mut out);
        graph.nodes.len().hash(&mut out);
        for node in &graph.nodes {
            write_op(&node.op, &mut out);
            node.operands.hash(&mut out);
            node.shape.hash(&mut out);
            node.name.hash(&mut out);
        }
        graph.root.hash(&mut out);

        options.argument_layouts.hash(&mut out);
        options.result_layout.hash(&mut out);
        options.num_replicas.hash(&mut out);
        options.device_handles.hash(&mut out);
        let mut disabled = options.debug_options.disabled_passes.clone();
        disabled.sort();
        disabled.dedup();
        disabled.hash(&mut out);

        CompilationKey {
            fingerprint: out.finish(),
            content: out.bytes,
        }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

/// Statistics for the compilation cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    /// Number of entries in cache
    pub size: usize,
    /// Total compilation time saved (approximate)
    pub time_saved: Duration,
}

impl CacheStats {
    /// Calculate hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub executable: Arc<Executable>,
    pub hit: bool,
}

#[derive(Default)]
struct CacheSlot {
    executable: Mutex<Option<Arc<Executable>>>,
}

#[derive(Default)]
struct CacheEntries {
    slots: HashMap<CompilationKey, Arc<CacheSlot>>,
    /// Insertion order for FIFO eviction.
    order: VecDeque<CompilationKey>,
}

/// Content-addressed executable cache.
///
/// Each key owns a slot whose lock is held for the duration of the
/// compile, so concurrent identical requests compile once and share the
/// result. Failed compiles leave nothing behind.
pub struct CompilationCache {
    entries: Mutex<CacheEntries>,
    stats: Mutex<CacheStats>,
    max_size: usize,
}

impl CompilationCache {
    /// Create a cache holding at most `max_size` executables; 0 disables
    /// caching.
    pub fn new(max_size: usize) -> Self {
        CompilationCache {
            entries: Mutex::new(CacheEntries::default()),
            stats: Mutex::new(CacheStats::default()),
            max_size,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_size > 0
    }

    /// Return the cached executable for `key`, compiling it on a miss.
    pub fn get_or_compile<F>(&self, key: CompilationKey, compile: F) -> ServiceResult<CacheLookup>
    where
        F: FnOnce() -> ServiceResult<Executable>,
    {
        if !self.is_enabled() {
            let executable = Arc::new(compile()?);
            self.stats.lock().misses += 1;
            return Ok(CacheLookup {
                executable,
                hit: false,
            });
        }

        let slot = self.slot_for(&key);
        let mut cached = slot.executable.lock();
        if let Some(executable) = cached.as_ref() {
            let mut stats = self.stats.lock();
            stats.hits += 1;
            stats.time_saved += executable.stats.compilation_time;
            return Ok(CacheLookup {
                executable: Arc::clone(executable),
                hit: true,
            });
        }

        match compile() {
            Ok(executable) => {
                let executable = Arc::new(executable);
                *cached = Some(Arc::clone(&executable));
                self.stats.lock().misses += 1;
                Ok(CacheLookup {
                    executable,
                    hit: false,
                })
            }
            Err(err) => {
                drop(cached);
                self.discard(&key, &slot);
                self.stats.lock().misses += 1;
                Err(err)
            }
        }
    }

    fn slot_for(&self, key: &CompilationKey) -> Arc<CacheSlot> {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.slots.get(key) {
            return Arc::clone(slot);
        }
        while entries.slots.len() >= self.max_size {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.slots.remove(&oldest);
        }
        let slot = Arc::new(CacheSlot::default());
        entries.order.push_back(key.clone());
        entries.slots.insert(key.clone(), Arc::clone(&slot));
        self.stats.lock().size = entries.slots.len();
        slot
    }

    fn discard(&self, key: &CompilationKey, slot: &Arc<CacheSlot>) {
        let mut entries = self.entries.lock();
        let current = entries
            .slots
            .get(key)
            .is_some_and(|existing| Arc::ptr_eq(existing, slot));
        // A slot locked by another compile is still in use.
        let empty = slot
            .executable
            .try_lock()
            .is_some_and(|cached| cached.is_none());
        if current && empty {
            entries.slots.remove(key);
            entries.order.retain(|k| k != key);
            self.stats.lock().size = entries.slots.len();
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compiles graphs through the cache and registers the executables.
pub struct CompilationAdapter {
    compiler: Arc<dyn Compiler>,
    cache: CompilationCache,
    registry: Arc<HandleRegistry>,
}

impl CompilationAdapter {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        cache_capacity: usize,
        registry: Arc<HandleRegistry>,
    ) -> Self {
        Self {
            compiler,
            cache: CompilationCache::new(cache_capacity),
            registry,
        }
    }

    /// Produce an executable without registering it.
    pub fn build(
        &self,
        graph: &ComputationGraph,
        options: &ExecutionOptions,
    ) -> ServiceResult<CacheLookup> {
        let key = CompilationKey::new(graph, options);
        let fingerprint = key.fingerprint();
        let lookup = self
            .cache
            .get_or_compile(key, || self.compiler.compile(graph, options))?;
        tracing::debug!(
            graph = %graph.name,
            fingerprint = format_args!("{:016x}", fingerprint),
            cache_hit = lookup.hit,
            "built executable"
        );
        Ok(lookup)
    }

    /// Compile and register. Every call yields a fresh handle, including
    /// cache hits; a failed compile registers nothing.
    pub fn compile(
        &self,
        graph: &ComputationGraph,
        options: &ExecutionOptions,
    ) -> ServiceResult<ExecutionHandle> {
        let lookup = self.build(graph, options)?;
        let summary = lookup.executable.summary();
        let handle = self.registry.register_executable(lookup.executable);
        tracing::info!(%handle, cache_hit = lookup.hit, executable = %summary, "compiled");
        Ok(handle)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcomp_ir::{BinaryOp, ElementType, Layout, UnaryOp};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn add_one() -> ComputationGraph {
        let mut graph = ComputationGraph::new("add_one");
        let x = graph.parameter(0, Shape::scalar(ElementType::S32)).unwrap();
        let one = graph.constant(Literal::s32(1)).unwrap();
        graph.binary(BinaryOp::Add, x, one).unwrap();
        graph
    }

    fn matrix_identity() -> ComputationGraph {
        let mut graph = ComputationGraph::new("identity");
        let x = graph
            .parameter(0, Shape::array(ElementType::F32, vec![2, 3]))
            .unwrap();
        graph.set_root(x).unwrap();
        graph
    }

    #[test]
    fn test_constant_folding_and_dce() {
        let mut graph = ComputationGraph::new("fold");
        let x = graph.parameter(0, Shape::scalar(ElementType::F32)).unwrap();
        let two = graph.constant(Literal::f32(2.0)).unwrap();
        let three = graph.constant(Literal::f32(3.0)).unwrap();
        let five = graph.binary(BinaryOp::Add, two, three).unwrap();
        graph.binary(BinaryOp::Multiply, x, five).unwrap();

        let executable = HostCompiler
            .compile(&graph, &ExecutionOptions::default())
            .unwrap();
        assert_eq!(executable.stats.constants_folded, 1);
        assert_eq!(executable.stats.dead_nodes_eliminated, 2);
        assert_eq!(executable.program.node_count(), 3);
        assert!(executable.program.validate().is_ok());
        assert!(executable
            .program
            .nodes
            .iter()
            .any(|n| n.op == OpKind::Constant { literal: Literal::f32(5.0) }));
    }

    #[test]
    fn test_disabled_passes() {
        let mut graph = ComputationGraph::new("nofold");
        let two = graph.constant(Literal::f32(2.0)).unwrap();
        graph.unary(UnaryOp::Neg, two).unwrap();
        let options = ExecutionOptions::default()
            .disable_pass(PASS_CONSTANT_FOLDING)
            .disable_pass(PASS_DEAD_CODE_ELIMINATION);
        let executable = HostCompiler.compile(&graph, &options).unwrap();
        assert!(executable.stats.passes_run.is_empty());
        assert_eq!(executable.program, graph);
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let mut graph = ComputationGraph::new("div0");
        let one = graph.constant(Literal::s32(1)).unwrap();
        let zero = graph.constant(Literal::s32(0)).unwrap();
        graph.binary(BinaryOp::Divide, one, zero).unwrap();
        let executable = HostCompiler
            .compile(&graph, &ExecutionOptions::default())
            .unwrap();
        assert_eq!(executable.stats.constants_folded, 0);
    }

    #[test]
    fn test_argument_layouts() {
        let column_major =
            Shape::array(ElementType::F32, vec![2, 3]).with_layout(Layout::column_major(2));
        let options = ExecutionOptions::default().with_argument_layouts(vec![column_major.clone()]);
        let executable = HostCompiler.compile(&matrix_identity(), &options).unwrap();
        assert_eq!(executable.parameter_shapes, vec![column_major]);

        let conflicting = ExecutionOptions::default()
            .with_argument_layouts(vec![Shape::array(ElementType::F32, vec![3, 2])]);
        assert!(matches!(
            HostCompiler.compile(&matrix_identity(), &conflicting),
            Err(ServiceError::CompileError(_))
        ));
    }

    #[test]
    fn test_result_layout_applied() {
        let layout =
            Shape::array(ElementType::F32, vec![2, 3]).with_layout(Layout::column_major(2));
        let options = ExecutionOptions::default().with_result_layout(layout.clone());
        let executable = HostCompiler.compile(&matrix_identity(), &options).unwrap();
        assert_eq!(executable.result_shape, layout);
    }

    #[test]
    fn test_debug_dump_options_compile() {
        let mut options = ExecutionOptions::default();
        options.debug_options.verbose_compile = true;
        options.debug_options.dump_to = Some("/tmp/devcomp-dump".to_string());
        options.debug_options.dump_graph_as_text = true;
        options.debug_options.dump_include_timestamp = true;
        let executable = HostCompiler.compile(&add_one(), &options).unwrap();
        assert_eq!(executable.result_shape, Shape::scalar(ElementType::S32));
        assert_eq!(executable.stats.passes_run.len(), 2);
    }

    #[test]
    fn test_invalid_graph_is_compile_error() {
        let mut graph = add_one();
        graph.nodes[2].operands = vec![0, 5];
        assert!(matches!(
            HostCompiler.compile(&graph, &ExecutionOptions::default()),
            Err(ServiceError::CompileError(_))
        ));
        let zero_replicas = ExecutionOptions::default().with_replicas(0);
        assert!(matches!(
            HostCompiler.compile(&add_one(), &zero_replicas),
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_key_ignores_seed_but_not_layouts() {
        let graph = add_one();
        let base = CompilationKey::new(&graph, &ExecutionOptions::default());
        let seeded = CompilationKey::new(&graph, &ExecutionOptions::default().with_seed(9));
        assert_eq!(base, seeded);
        let replicated = CompilationKey::new(&graph, &ExecutionOptions::default().with_replicas(2));
        assert_ne!(base, replicated);

        let mut nan_graph = ComputationGraph::new("nan");
        nan_graph.constant(Literal::f32(f32::NAN)).unwrap();
        let a = CompilationKey::new(&nan_graph, &ExecutionOptions::default());
        let b = CompilationKey::new(&nan_graph, &ExecutionOptions::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_hits_and_errors_not_cached() {
        let cache = CompilationCache::new(4);
        let graph = add_one();
        let options = ExecutionOptions::default();
        let key = CompilationKey::new(&graph, &options);

        let failed = cache.get_or_compile(key.clone(), || {
            Err(ServiceError::CompileError("boom".to_string()))
        });
        assert!(failed.is_err());
        assert!(cache.is_empty());

        let first = cache
            .get_or_compile(key.clone(), || HostCompiler.compile(&graph, &options))
            .unwrap();
        assert!(!first.hit);
        let second = cache
            .get_or_compile(key, || panic!("should be cached"))
            .unwrap();
        assert!(second.hit);
        assert!(Arc::ptr_eq(&first.executable, &second.executable));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_fifo_eviction() {
        let cache = CompilationCache::new(2);
        let options = ExecutionOptions::default();
        let graphs: Vec<ComputationGraph> = (0..3)
            .map(|i| {
                let mut g = ComputationGraph::new(format!("g{}", i));
                g.constant(Literal::s32(i)).unwrap();
                g
            })
            .collect();
        for graph in &graphs {
            cache
                .get_or_compile(CompilationKey::new(graph, &options), || {
                    HostCompiler.compile(graph, &options)
                })
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        let evicted = cache
            .get_or_compile(CompilationKey::new(&graphs[0], &options), || {
                HostCompiler.compile(&graphs[0], &options)
            })
            .unwrap();
        assert!(!evicted.hit);
    }

    #[test]
    fn test_single_flight() {
        let cache = Arc::new(CompilationCache::new(8));
        let compiles = Arc::new(AtomicUsize::new(0));
        let graph = add_one();
        let options = ExecutionOptions::default();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let compiles = Arc::clone(&compiles);
                let graph = graph.clone();
                let options = options.clone();
                thread::spawn(move || {
                    let key = CompilationKey::new(&graph, &options);
                    cache
                        .get_or_compile(key, || {
                            compiles.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(20));
                            HostCompiler.compile(&graph, &options)
                        })
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<CacheLookup> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(compiles.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| Arc::ptr_eq(&r.executable, &results[0].executable)));
    }

    #[test]
    fn test_disabled_cache() {
        let cache = CompilationCache::new(0);
        let graph = add_one();
        let options = ExecutionOptions::default();
        for _ in 0..2 {
            let lookup = cache
                .get_or_compile(CompilationKey::new(&graph, &options), || {
                    HostCompiler.compile(&graph, &options)
                })
                .unwrap();
            assert!(!lookup.hit);
        }
        assert_eq!(cache.stats().misses, 2);
    }
}
