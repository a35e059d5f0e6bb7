//! Execution coordinator.
//!
//! Each device owns a worker thread that drains a FIFO job queue, so work
//! for one device runs in submission order. An execution fans out into one
//! job per replica; the last replica to finish registers the outputs, which
//! happens only when every replica succeeded.
//!
//! Executions move through `Submitted -> Dispatched -> {Completed, Failed}`.

use devcomp_ir::Literal;
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backend::{evaluate, Evaluation, ReplicaContext};
use crate::compile::Executable;
use crate::error::{ServiceError, ServiceResult};
use crate::feed::{CancelToken, Channel, FeedRegistry};
use crate::handle::{ChannelHandle, DeviceHandle, ExecutionToken, GlobalDataHandle};
use crate::options::ExecutionOptions;
use crate::platform::Device;
use crate::registry::HandleRegistry;
use crate::transfer::TransferManager;

/// Lifecycle phase of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Submitted,
    Dispatched,
    Completed,
    Failed,
}

impl ExecutionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionPhase::Completed | ExecutionPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPhase::Submitted => "submitted",
            ExecutionPhase::Dispatched => "dispatched",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Profiling information returned with every execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub compile_cache_hit: bool,
    /// Longest per-replica compute time.
    pub compute_time_us: u64,
    /// Nodes executed, per replica.
    pub nodes_executed: Vec<usize>,
    pub num_replicas: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Result of replica 0.
    pub output: GlobalDataHandle,
    /// One result per replica, only when requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_outputs: Vec<GlobalDataHandle>,
    pub profile: ExecutionProfile,
}

#[derive(Debug)]
enum ExecutionState {
    Submitted,
    Dispatched,
    Completed(ExecuteResponse),
    Failed(ServiceError),
}

impl ExecutionState {
    fn phase(&self) -> ExecutionPhase {
        match self {
            ExecutionState::Submitted => ExecutionPhase::Submitted,
            ExecutionState::Dispatched => ExecutionPhase::Dispatched,
            ExecutionState::Completed(_) => ExecutionPhase::Completed,
            ExecutionState::Failed(_) => ExecutionPhase::Failed,
        }
    }
}

struct ReplicaResults {
    pending: usize,
    outputs: Vec<Option<Evaluation>>,
    compute_time: Duration,
    failure: Option<ServiceError>,
}

struct ExecutionRecord {
    token: ExecutionToken,
    state: Mutex<ExecutionState>,
    finished: Condvar,
    cancel_token: CancelToken,
    replicas: Mutex<ReplicaResults>,
}

impl ExecutionRecord {
    fn new(token: ExecutionToken, num_replicas: usize) -> Self {
        Self {
            token,
            state: Mutex::new(ExecutionState::Submitted),
            finished: Condvar::new(),
            cancel_token: CancelToken::new(),
            replicas: Mutex::new(ReplicaResults {
                pending: num_replicas,
                outputs: vec![None; num_replicas],
                compute_time: Duration::ZERO,
                failure: None,
            }),
        }
    }

    fn phase(&self) -> ExecutionPhase {
        self.state.lock().phase()
    }

    fn mark_dispatched(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ExecutionState::Submitted) {
            *state = ExecutionState::Dispatched;
        }
    }

    /// Record one replica's outcome. Returns the combined outcome once the
    /// last replica reports.
    fn finish_replica(
        &self,
        replica: usize,
        outcome: ServiceResult<Evaluation>,
        elapsed: Duration,
    ) -> Option<ServiceResult<(Vec<Evaluation>, Duration)>> {
        let mut results = self.replicas.lock();
        results.compute_time = results.compute_time.max(elapsed);
        match outcome {
            Ok(evaluation) => results.outputs[replica] = Some(evaluation),
            Err(err) => {
                if results.failure.is_none() {
                    results.failure = Some(err);
                }
                // Siblings may be blocked on channels fed by this replica.
                self.cancel_token.cancel();
            }
        }
        results.pending -= 1;
        if results.pending > 0 {
            return None;
        }
        if let Some(err) = results.failure.take() {
            return Some(Err(err));
        }
        let evaluations: Vec<Evaluation> = results
            .outputs
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        Some(Ok((evaluations, results.compute_time)))
    }

    /// Enter a terminal state. Returns false when the record was already
    /// terminal.
    fn complete(&self, outcome: ExecutionState) -> bool {
        let mut state = self.state.lock();
        if state.phase().is_terminal() {
            return false;
        }
        *state = outcome;
        self.finished.notify_all();
        true
    }

    fn wait(&self) -> ServiceResult<ExecuteResponse> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                ExecutionState::Completed(response) => return Ok(response.clone()),
                ExecutionState::Failed(err) => return Err(err.clone()),
                _ => {}
            }
            self.finished.wait(&mut state);
        }
    }

    fn cancel(&self) -> ExecutionPhase {
        let mut state = self.state.lock();
        match state.phase() {
            ExecutionPhase::Submitted => {
                self.cancel_token.cancel();
                *state = ExecutionState::Failed(ServiceError::Cancelled);
                self.finished.notify_all();
            }
            ExecutionPhase::Dispatched => self.cancel_token.cancel(),
            ExecutionPhase::Completed | ExecutionPhase::Failed => {}
        }
        state.phase()
    }
}

/// Everything a replica job needs, shared by all replicas of one execution.
struct ExecutionPlan {
    record: Arc<ExecutionRecord>,
    executable: Arc<Executable>,
    arguments: Vec<Literal>,
    devices: Vec<Arc<Device>>,
    channels: HashMap<u64, Arc<Channel>>,
    seed: u64,
    per_replica_results: bool,
    cache_hit: bool,
    registry: Arc<HandleRegistry>,
    transfers: Arc<TransferManager>,
    feeds: Arc<FeedRegistry>,
}

impl ExecutionPlan {
    fn run_replica(&self, replica: usize) {
        let record = &self.record;
        let started = Instant::now();
        let outcome = if record.cancel_token.is_cancelled() {
            Err(ServiceError::Cancelled)
        } else {
            record.mark_dispatched();
            let device = &self.devices[replica];
            let replica_id = replica as u32;
            let mut ctx = ReplicaContext {
                replica_id,
                infeed: self.feeds.infeed(device.handle, replica_id),
                outfeed: self.feeds.outfeed(device.handle, replica_id),
                channels: &self.channels,
                rng: StdRng::seed_from_u64(self.seed.wrapping_add(replica as u64)),
                cancel: &record.cancel_token,
                memory_limit: device.memory.capacity(),
            };
            panic::catch_unwind(AssertUnwindSafe(|| {
                evaluate(&self.executable.program, &self.arguments, &mut ctx)
            }))
            .unwrap_or_else(|payload| {
                Err(ServiceError::DeviceError(format!(
                    "replica {} panicked: {}",
                    replica,
                    panic_message(payload.as_ref())
                )))
            })
        };
        if let Some(combined) = record.finish_replica(replica, outcome, started.elapsed()) {
            self.finalize(combined);
        }
    }

    fn finalize(&self, combined: ServiceResult<(Vec<Evaluation>, Duration)>) {
        let token = self.record.token;
        let outcome = combined.and_then(|(evaluations, compute_time)| {
            self.register_outputs(evaluations, compute_time)
        });
        match outcome {
            Ok(response) => {
                let output = response.output;
                let placed = response.replica_outputs.clone();
                if self.record.complete(ExecutionState::Completed(response)) {
                    tracing::debug!(%token, %output, "execution completed");
                } else {
                    self.release_all(output, &placed);
                }
            }
            Err(err) => {
                if matches!(err, ServiceError::Cancelled) {
                    tracing::warn!(%token, "execution cancelled");
                } else {
                    tracing::warn!(%token, error = %err, "execution failed");
                }
                self.record.complete(ExecutionState::Failed(err));
            }
        }
    }

    fn register_outputs(
        &self,
        evaluations: Vec<Evaluation>,
        compute_time: Duration,
    ) -> ServiceResult<ExecuteResponse> {
        let result_shape = &self.executable.result_shape;
        let nodes_executed = evaluations.iter().map(|e| e.nodes_executed).collect();
        let count = if self.per_replica_results {
            evaluations.len()
        } else {
            1
        };

        let mut placed: Vec<GlobalDataHandle> = Vec::with_capacity(count);
        for (replica, evaluation) in evaluations.into_iter().take(count).enumerate() {
            let stored = evaluation
                .output
                .relayout(result_shape)
                .map_err(|err| ServiceError::DeviceError(err.to_string()))
                .and_then(|literal| {
                    self.transfers
                        .place(literal, Some(result_shape.clone()), &self.devices[replica])
                });
            match stored {
                Ok(handle) => placed.push(handle),
                Err(err) => {
                    for handle in placed {
                        let _ = self.registry.release_data(handle);
                    }
                    return Err(ServiceError::DeviceError(format!(
                        "failed to store result of replica {}: {}",
                        replica, err
                    )));
                }
            }
        }

        let Some(&output) = placed.first() else {
            return Err(ServiceError::DeviceError(
                "execution produced no result".to_string(),
            ));
        };
        Ok(ExecuteResponse {
            output,
            replica_outputs: if self.per_replica_results {
                placed
            } else {
                Vec::new()
            },
            profile: ExecutionProfile {
                compile_cache_hit: self.cache_hit,
                compute_time_us: compute_time.as_micros() as u64,
                nodes_executed,
                num_replicas: self.devices.len(),
            },
        })
    }

    fn release_all(&self, output: GlobalDataHandle, replica_outputs: &[GlobalDataHandle]) {
        let _ = self.registry.release_data(output);
        for &handle in replica_outputs.iter().filter(|&&h| h != output) {
            let _ = self.registry.release_data(handle);
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A thread running jobs for one device in FIFO order.
struct DeviceWorker {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceWorker {
    fn spawn(device: &Device) -> ServiceResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name(format!("devcomp-device-{}", device.ordinal))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        tracing::error!(
                            panic = %panic_message(payload.as_ref()),
                            "device job panicked"
                        );
                    }
                }
            })
            .map_err(|err| {
                ServiceError::DeviceError(format!("cannot start worker for {}: {}", device, err))
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn submit(&self, job: Job) -> ServiceResult<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| ServiceError::DeviceError("device worker is shut down".to_string()))?;
        sender
            .send(job)
            .map_err(|_| ServiceError::DeviceError("device worker has stopped".to_string()))
    }

    fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

/// Dispatches executables onto device workers and tracks executions.
pub struct ExecutionCoordinator {
    registry: Arc<HandleRegistry>,
    transfers: Arc<TransferManager>,
    feeds: Arc<FeedRegistry>,
    workers: HashMap<DeviceHandle, DeviceWorker>,
    executions: Mutex<HashMap<u64, Arc<ExecutionRecord>>>,
    default_seed: Option<u64>,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<HandleRegistry>,
        transfers: Arc<TransferManager>,
        feeds: Arc<FeedRegistry>,
        default_seed: Option<u64>,
    ) -> ServiceResult<Self> {
        let mut workers = HashMap::new();
        for device in registry.devices() {
            workers.insert(device.handle, DeviceWorker::spawn(&device)?);
        }
        Ok(Self {
            registry,
            transfers,
            feeds,
            workers,
            executions: Mutex::new(HashMap::new()),
            default_seed,
        })
    }

    /// Validate and dispatch an execution without waiting for it.
    ///
    /// Argument count and shapes, devices and channels are all checked
    /// before anything is queued.
    pub fn execute_async(
        &self,
        executable: Arc<Executable>,
        arguments: &[GlobalDataHandle],
        options: &ExecutionOptions,
        cache_hit: bool,
    ) -> ServiceResult<ExecutionToken> {
        let parameters = &executable.parameter_shapes;
        if arguments.len() != parameters.len() {
            return Err(ServiceError::ShapeMismatch(format!(
                "expected {} arguments, got {}",
                parameters.len(),
                arguments.len()
            )));
        }
        let mut literals = Vec::with_capacity(arguments.len());
        for (index, (&handle, parameter)) in arguments.iter().zip(parameters).enumerate() {
            let data = self.registry.resolve_data(handle)?;
            let actual = data.shape.normalized();
            if &actual != parameter {
                return Err(ServiceError::ShapeMismatch(format!(
                    "argument {} ({}) has shape {} but parameter {} expects {}",
                    index, handle, actual, index, parameter
                )));
            }
            literals.push(data.buffer.to_literal());
        }

        let devices = self.assign_devices(&executable, options)?;
        let mut channels = HashMap::new();
        for id in executable.channel_ids() {
            channels.insert(id, self.registry.resolve_channel(ChannelHandle(id))?);
        }

        let token = ExecutionToken(self.registry.reserve_id());
        let record = Arc::new(ExecutionRecord::new(token, devices.len()));
        let seed = options
            .seed
            .or(self.default_seed)
            .unwrap_or_else(rand::random);
        let plan = Arc::new(ExecutionPlan {
            record: Arc::clone(&record),
            executable: Arc::clone(&executable),
            arguments: literals,
            devices: devices.clone(),
            channels,
            seed,
            per_replica_results: options.per_replica_results,
            cache_hit,
            registry: Arc::clone(&self.registry),
            transfers: Arc::clone(&self.transfers),
            feeds: Arc::clone(&self.feeds),
        });
        self.executions.lock().insert(token.0, Arc::clone(&record));

        tracing::info!(
            %token,
            executable = %executable.program.name,
            replicas = devices.len(),
            seed,
            "execution submitted"
        );
        for (replica, device) in devices.iter().enumerate() {
            let plan = Arc::clone(&plan);
            let submitted = self
                .worker(device.handle)
                .and_then(|worker| worker.submit(Box::new(move || plan.run_replica(replica))));
            if let Err(err) = submitted {
                // Replicas already queued will observe the cancellation.
                record.cancel_token.cancel();
                record.complete(ExecutionState::Failed(err));
                break;
            }
        }
        Ok(token)
    }

    fn assign_devices(
        &self,
        executable: &Executable,
        options: &ExecutionOptions,
    ) -> ServiceResult<Vec<Arc<Device>>> {
        let replicas = executable.num_replicas;
        let handles: Vec<DeviceHandle> = if !options.device_handles.is_empty() {
            options.device_handles.clone()
        } else if !executable.device_assignment.is_empty() {
            executable.device_assignment.clone()
        } else {
            self.registry
                .devices()
                .iter()
                .take(replicas)
                .map(|device| device.handle)
                .collect()
        };
        if handles.len() != replicas {
            return Err(ServiceError::InvalidArgument(format!(
                "{} replicas need {} devices, {} available",
                replicas,
                replicas,
                handles.len()
            )));
        }
        let distinct: HashSet<DeviceHandle> = handles.iter().copied().collect();
        if distinct.len() != handles.len() {
            return Err(ServiceError::InvalidArgument(
                "each replica needs its own device".to_string(),
            ));
        }
        handles
            .into_iter()
            .map(|handle| self.registry.resolve_device(handle))
            .collect()
    }

    fn worker(&self, device: DeviceHandle) -> ServiceResult<&DeviceWorker> {
        self.workers
            .get(&device)
            .ok_or_else(|| ServiceError::invalid_handle(device.0, "no worker for this device"))
    }

    fn record(&self, token: ExecutionToken) -> ServiceResult<Arc<ExecutionRecord>> {
        self.executions
            .lock()
            .get(&token.0)
            .cloned()
            .ok_or(ServiceError::InvalidToken(token.0))
    }

    /// Block until the execution finishes. Repeated waits return the same
    /// result.
    pub fn wait(&self, token: ExecutionToken) -> ServiceResult<ExecuteResponse> {
        self.record(token)?.wait()
    }

    pub fn phase(&self, token: ExecutionToken) -> ServiceResult<ExecutionPhase> {
        Ok(self.record(token)?.phase())
    }

    /// Drop a finished execution record; later waits fail with
    /// `InvalidToken`.
    pub fn release(&self, token: ExecutionToken) -> ServiceResult<()> {
        let mut executions = self.executions.lock();
        let record = executions
            .get(&token.0)
            .ok_or(ServiceError::InvalidToken(token.0))?;
        if !record.phase().is_terminal() {
            return Err(ServiceError::InvalidArgument(format!(
                "{} is still {}",
                token,
                record.phase()
            )));
        }
        executions.remove(&token.0);
        Ok(())
    }

    /// Request cancellation and report the phase observed afterwards.
    pub fn cancel(&self, token: ExecutionToken) -> ServiceResult<ExecutionPhase> {
        let phase = self.record(token)?.cancel();
        tracing::info!(%token, %phase, "cancellation requested");
        Ok(phase)
    }

    pub fn execute(
        &self,
        executable: Arc<Executable>,
        arguments: &[GlobalDataHandle],
        options: &ExecutionOptions,
        cache_hit: bool,
    ) -> ServiceResult<ExecuteResponse> {
        let token = self.execute_async(executable, arguments, options, cache_hit)?;
        let result = self.wait(token);
        self.release(token)?;
        result
    }

    /// Wait until everything queued on `device` so far has run.
    pub fn barrier(&self, device: DeviceHandle) -> ServiceResult<()> {
        let (done, reached) = mpsc::channel::<()>();
        self.worker(device)?.submit(Box::new(move || {
            let _ = done.send(());
        }))?;
        reached.recv().map_err(|_| {
            ServiceError::DeviceError(format!("worker of {} stopped before the barrier", device))
        })
    }

    /// Executions not yet released.
    pub fn tracked_count(&self) -> usize {
        self.executions.lock().len()
    }

    /// Executions that have not reached a terminal phase.
    pub fn in_flight_count(&self) -> usize {
        self.executions
            .lock()
            .values()
            .filter(|record| !record.phase().is_terminal())
            .count()
    }

    /// Cancel outstanding work and stop every worker.
    pub fn shutdown(&self) {
        let records: Vec<Arc<ExecutionRecord>> = self.executions.lock().values().cloned().collect();
        for record in records {
            record.cancel();
        }
        for worker in self.workers.values() {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{Compiler, HostCompiler};
    use crate::config::PlatformConfig;
    use crate::platform::{HostPlatform, Platform};
    use devcomp_ir::{BinaryOp, ComputationGraph, ElementType, Shape};

    struct Fixture {
        coordinator: ExecutionCoordinator,
        transfers: Arc<TransferManager>,
        registry: Arc<HandleRegistry>,
        feeds: Arc<FeedRegistry>,
    }

    fn fixture(devices: usize) -> Fixture {
        let config = PlatformConfig {
            device_count: devices,
            ..PlatformConfig::default()
        };
        let platform = Arc::new(HostPlatform::new(&config));
        let registry = Arc::new(HandleRegistry::new());
        for ordinal in 0..devices {
            registry.register_device(ordinal, platform.name(), platform.memory_capacity(ordinal));
        }
        let feeds = Arc::new(FeedRegistry::new());
        let transfers = Arc::new(TransferManager::new(
            Arc::clone(&registry),
            platform,
            Arc::clone(&feeds),
            None,
        ));
        let coordinator = ExecutionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&transfers),
            Arc::clone(&feeds),
            Some(1),
        )
        .unwrap();
        Fixture {
            coordinator,
            transfers,
            registry,
            feeds,
        }
    }

    fn compile(graph: &ComputationGraph, options: &ExecutionOptions) -> Arc<Executable> {
        Arc::new(HostCompiler.compile(graph, options).unwrap())
    }

    fn add_one() -> ComputationGraph {
        let mut graph = ComputationGraph::new("add_one");
        let x = graph.parameter(0, Shape::scalar(ElementType::S32)).unwrap();
        let one = graph.constant(Literal::s32(1)).unwrap();
        graph.binary(BinaryOp::Add, x, one).unwrap();
        graph
    }

    #[test]
    fn test_execute_add_one() {
        let f = fixture(1);
        let options = ExecutionOptions::default();
        let arg = f.transfers.transfer_to_server(Literal::s32(5), None).unwrap();
        let response = f
            .coordinator
            .execute(compile(&add_one(), &options), &[arg], &options, false)
            .unwrap();
        assert_eq!(
            f.transfers.transfer_to_client(response.output, None).unwrap(),
            Literal::s32(6)
        );
        assert_eq!(f.coordinator.tracked_count(), 0);
        f.coordinator.shutdown();
    }

    #[test]
    fn test_argument_shape_checked_before_dispatch() {
        let f = fixture(1);
        let options = ExecutionOptions::default();
        let arg = f.transfers.transfer_to_server(Literal::f32(5.0), None).unwrap();
        let err = f
            .coordinator
            .execute_async(compile(&add_one(), &options), &[arg], &options, false)
            .unwrap_err();
        assert!(matches!(err, ServiceError::ShapeMismatch(_)));
        let err = f
            .coordinator
            .execute_async(compile(&add_one(), &options), &[], &options, false)
            .unwrap_err();
        assert!(matches!(err, ServiceError::ShapeMismatch(_)));
        assert_eq!(f.coordinator.tracked_count(), 0);
        f.coordinator.shutdown();
    }

    #[test]
    fn test_panicking_replica_fails_and_worker_survives() {
        let f = fixture(1);
        let options = ExecutionOptions::default();
        let mut broken = HostCompiler.compile(&add_one(), &options).unwrap();
        let last = broken.program.nodes.len() - 1;
        broken.program.nodes[last].operands = vec![0, 9];

        let arg = f.transfers.transfer_to_server(Literal::s32(1), None).unwrap();
        let token = f
            .coordinator
            .execute_async(Arc::new(broken), &[arg], &options, false)
            .unwrap();
        assert!(matches!(
            f.coordinator.wait(token),
            Err(ServiceError::DeviceError(ref m)) if m.contains("panicked")
        ));
        assert_eq!(f.coordinator.phase(token).unwrap(), ExecutionPhase::Failed);

        let worker = f.coordinator.workers.values().next().unwrap();
        worker.submit(Box::new(|| panic!("stray job"))).unwrap();

        let response = f
            .coordinator
            .execute(compile(&add_one(), &options), &[arg], &options, false)
            .unwrap();
        assert_eq!(
            f.transfers.transfer_to_client(response.output, None).unwrap(),
            Literal::s32(2)
        );
        f.coordinator.shutdown();
    }

    #[test]
    fn test_node_larger_than_device_memory_fails() {
        let f = fixture(1);
        let options = ExecutionOptions::default();
        let mut graph = ComputationGraph::new("huge_rng");
        graph
            .rng_uniform(Shape::array(ElementType::F64, vec![1 << 45]))
            .unwrap();
        let err = f
            .coordinator
            .execute(compile(&graph, &options), &[], &options, false)
            .unwrap_err();
        assert!(matches!(err, ServiceError::DeviceError(_)));
        assert_eq!(f.coordinator.tracked_count(), 0);
        f.coordinator.shutdown();
    }

    #[test]
    fn test_wait_is_idempotent_until_release() {
        let f = fixture(1);
        let options = ExecutionOptions::default();
        let arg = f.transfers.transfer_to_server(Literal::s32(1), None).unwrap();
        let token = f
            .coordinator
            .execute_async(compile(&add_one(), &options), &[arg], &options, false)
            .unwrap();
        let first = f.coordinator.wait(token).unwrap();
        let second = f.coordinator.wait(token).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.coordinator.phase(token).unwrap(), ExecutionPhase::Completed);
        f.coordinator.release(token).unwrap();
        assert_eq!(
            f.coordinator.wait(token).unwrap_err(),
            ServiceError::InvalidToken(token.0)
        );
        f.coordinator.shutdown();
    }

    #[test]
    fn test_cancel_blocked_infeed() {
        let f = fixture(1);
        let mut graph = ComputationGraph::new("wait_for_infeed");
        graph.infeed(Shape::scalar(ElementType::F32)).unwrap();
        let options = ExecutionOptions::default();
        let token = f
            .coordinator
            .execute_async(compile(&graph, &options), &[], &options, false)
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        let phase = f.coordinator.cancel(token).unwrap();
        assert!(matches!(
            phase,
            ExecutionPhase::Dispatched | ExecutionPhase::Failed
        ));
        assert_eq!(f.coordinator.wait(token).unwrap_err(), ServiceError::Cancelled);
        assert_eq!(f.registry.live_data_count(), 0);
        f.coordinator.shutdown();
    }

    #[test]
    fn test_cancel_submitted_never_runs() {
        let f = fixture(1);
        let options = ExecutionOptions::default();
        let mut blocker = ComputationGraph::new("blocker");
        blocker.infeed(Shape::scalar(ElementType::F32)).unwrap();
        let blocking = f
            .coordinator
            .execute_async(compile(&blocker, &options), &[], &options, false)
            .unwrap();

        let mut graph = ComputationGraph::new("outfeed");
        let value = graph.constant(Literal::f32(1.0)).unwrap();
        graph.outfeed(value).unwrap();
        let queued = f
            .coordinator
            .execute_async(compile(&graph, &options), &[], &options, false)
            .unwrap();
        assert_eq!(f.coordinator.cancel(queued).unwrap(), ExecutionPhase::Failed);

        let device = f.registry.devices()[0].handle;
        f.feeds.infeed(device, 0).push(Literal::f32(2.0));
        f.coordinator.wait(blocking).unwrap();
        assert_eq!(f.coordinator.wait(queued).unwrap_err(), ServiceError::Cancelled);
        f.coordinator.barrier(device).unwrap();
        assert!(f.feeds.outfeed(device, 0).is_empty());
        f.coordinator.shutdown();
    }

    #[test]
    fn test_replicas_with_per_replica_results() {
        let f = fixture(2);
        let mut graph = ComputationGraph::new("replica_id");
        graph.replica_id().unwrap();
        let options = ExecutionOptions::default()
            .with_replicas(2)
            .with_per_replica_results();
        let response = f
            .coordinator
            .execute(compile(&graph, &options), &[], &options, false)
            .unwrap();
        assert_eq!(response.replica_outputs.len(), 2);
        assert_eq!(response.replica_outputs[0], response.output);
        let values: Vec<f64> = response
            .replica_outputs
            .iter()
            .map(|&h| {
                f.transfers
                    .transfer_to_client(h, None)
                    .unwrap()
                    .get_scalar()
                    .unwrap()
            })
            .collect();
        assert_eq!(values, vec![0.0, 1.0]);
        assert_eq!(response.profile.nodes_executed, vec![1, 1]);
        f.coordinator.shutdown();
    }

    #[test]
    fn test_replica_failure_registers_nothing() {
        let f = fixture(2);
        let mut graph = ComputationGraph::new("div");
        let id = graph.replica_id().unwrap();
        let one = graph.constant(Literal::scalar(ElementType::U32, 1.0)).unwrap();
        graph.binary(BinaryOp::Divide, one, id).unwrap();
        let options = ExecutionOptions::default()
            .with_replicas(2)
            .disable_pass(crate::options::PASS_CONSTANT_FOLDING);
        let err = f
            .coordinator
            .execute(compile(&graph, &options), &[], &options, false)
            .unwrap_err();
        assert!(matches!(err, ServiceError::DeviceError(_)));
        assert_eq!(f.registry.live_data_count(), 0);
        f.coordinator.shutdown();
    }

    #[test]
    fn test_too_many_replicas() {
        let f = fixture(1);
        let mut graph = ComputationGraph::new("two");
        graph.replica_id().unwrap();
        let options = ExecutionOptions::default().with_replicas(2);
        assert!(matches!(
            f.coordinator
                .execute_async(compile(&graph, &options), &[], &options, false),
            Err(ServiceError::InvalidArgument(_))
        ));
        f.coordinator.shutdown();
    }
}
