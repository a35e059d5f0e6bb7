//! Reference evaluator backing the host platform.

mod interpreter;

pub use interpreter::{evaluate, evaluate_pure, Evaluation, ReplicaContext};
