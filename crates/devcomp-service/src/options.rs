//! Per-request execution and debug options.
//!
//! All options are serde-defaulted: booleans default to false, unset
//! strings mean "disabled" and an unset seed lets the service choose.

use devcomp_ir::Shape;
use serde::{Deserialize, Serialize};

use crate::handle::DeviceHandle;

/// Name of the constant folding pass.
pub const PASS_CONSTANT_FOLDING: &str = "constant-folding";
/// Name of the dead code elimination pass.
pub const PASS_DEAD_CODE_ELIMINATION: &str = "dead-code-elimination";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Layouts requested for the parameters, in parameter order.
    pub argument_layouts: Vec<Shape>,
    /// Layout requested for the result.
    pub result_layout: Option<Shape>,
    pub seed: Option<u64>,
    pub num_replicas: usize,
    /// Device assignment per replica. Empty lets the service choose.
    pub device_handles: Vec<DeviceHandle>,
    /// Register one output handle per replica in addition to the primary.
    pub per_replica_results: bool,
    pub debug_options: DebugOptions,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            argument_layouts: Vec::new(),
            result_layout: None,
            seed: None,
            num_replicas: 1,
            device_handles: Vec::new(),
            per_replica_results: false,
            debug_options: DebugOptions::default(),
        }
    }
}

impl ExecutionOptions {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    pub fn with_devices(mut self, devices: Vec<DeviceHandle>) -> Self {
        self.device_handles = devices;
        self
    }

    pub fn with_argument_layouts(mut self, layouts: Vec<Shape>) -> Self {
        self.argument_layouts = layouts;
        self
    }

    pub fn with_result_layout(mut self, layout: Shape) -> Self {
        self.result_layout = Some(layout);
        self
    }

    pub fn with_per_replica_results(mut self) -> Self {
        self.per_replica_results = true;
        self
    }

    pub fn disable_pass(mut self, pass: impl Into<String>) -> Self {
        self.debug_options.disabled_passes.push(pass.into());
        self
    }
}

/// Diagnostics knobs. These are passive: they select passes and control
/// logging but never affect handle identity or results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub disabled_passes: Vec<String>,
    pub dump_to: Option<String>,
    pub dump_graph_as_text: bool,
    pub dump_include_timestamp: bool,
    pub verbose_compile: bool,
}

impl DebugOptions {
    pub fn pass_enabled(&self, pass: &str) -> bool {
        !self.disabled_passes.iter().any(|p| p == pass)
    }
}
