//! Node-by-node interpreter for compiled programs.

use devcomp_ir::{
    BinaryOp, ComputationGraph, ElementType, IrError, Literal, OpKind, ReduceOp, Shape, UnaryOp,
};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::feed::{CancelToken, Channel, FeedQueue, WaitError};

/// Per-replica state visible to side-effecting operations.
pub struct ReplicaContext<'a> {
    pub replica_id: u32,
    pub infeed: Arc<FeedQueue>,
    pub outfeed: Arc<FeedQueue>,
    /// Channels used by the program, keyed by channel id.
    pub channels: &'a HashMap<u64, Arc<Channel>>,
    pub rng: StdRng,
    pub cancel: &'a CancelToken,
    /// Largest node result the device can hold, in bytes.
    pub memory_limit: usize,
}

/// Result of running a program on one replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub output: Literal,
    pub nodes_executed: usize,
}

fn device_error(err: IrError) -> ServiceError {
    ServiceError::DeviceError(err.to_string())
}

/// Run `program` with the given arguments.
///
/// Cancellation is observed between nodes and inside blocking infeed and
/// channel waits. A node whose result would not fit in `memory_limit`
/// fails before anything is allocated for it.
pub fn evaluate(
    program: &ComputationGraph,
    arguments: &[Literal],
    ctx: &mut ReplicaContext<'_>,
) -> ServiceResult<Evaluation> {
    let root = program.root_index().map_err(device_error)?;
    let mut values: Vec<Literal> = Vec::with_capacity(program.nodes.len());

    for (position, node) in program.nodes.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        match node.shape.checked_byte_size() {
            Some(bytes) if bytes <= ctx.memory_limit => {}
            _ => {
                return Err(ServiceError::DeviceError(format!(
                    "node {} ({}) produces {}, which exceeds the {} byte device memory",
                    position,
                    node.op.name(),
                    node.shape,
                    ctx.memory_limit
                )));
            }
        }
        let operands: Vec<&Literal> = node.operands.iter().map(|&i| &values[i]).collect();
        let value = match &node.op {
            OpKind::Parameter { index, .. } => arguments.get(*index).cloned().ok_or_else(|| {
                ServiceError::DeviceError(format!("missing argument for parameter {}", index))
            })?,
            OpKind::Infeed { shape } => receive(&ctx.infeed, shape, ctx.cancel, "infeed")?,
            OpKind::Outfeed => {
                ctx.outfeed.push(operand(&operands, 0)?.clone());
                Literal::tuple(Vec::new())
            }
            OpKind::Send { channel } => {
                channel_queue(ctx.channels, *channel)?.push(operand(&operands, 0)?.clone());
                Literal::tuple(Vec::new())
            }
            OpKind::Recv { channel, shape } => {
                let queue = channel_queue(ctx.channels, *channel)?;
                receive(queue, shape, ctx.cancel, "channel")?
            }
            OpKind::ReplicaId => Literal::scalar(ElementType::U32, ctx.replica_id as f64),
            OpKind::RngUniform { shape } => random_uniform(shape, &mut ctx.rng)?,
            op => evaluate_pure(op, &operands)?,
        };
        tracing::trace!(node = position, op = node.op.name(), "evaluated node");
        values.push(value);
    }

    let nodes_executed = values.len();
    let output = values
        .into_iter()
        .nth(root)
        .ok_or_else(|| ServiceError::DeviceError(format!("root node {} was not evaluated", root)))?;
    Ok(Evaluation {
        output,
        nodes_executed,
    })
}

/// Evaluate an operation without side effects.
///
/// Also used for constant folding at compile time.
pub fn evaluate_pure(op: &OpKind, operands: &[&Literal]) -> ServiceResult<Literal> {
    match op {
        OpKind::Constant { literal } => Ok(literal.clone()),
        OpKind::Unary { op } => unary(*op, operand(operands, 0)?),
        OpKind::Binary { op } => binary(*op, operand(operands, 0)?, operand(operands, 1)?),
        OpKind::Reduce { op, axes } => reduce(*op, axes, operand(operands, 0)?),
        OpKind::Reshape { dims } => {
            let (element_type, _, values) = array(operand(operands, 0)?)?;
            Literal::from_values(element_type, dims.clone(), values.to_vec()).map_err(device_error)
        }
        OpKind::Tuple => Ok(Literal::tuple(
            operands.iter().map(|&literal| literal.clone()).collect(),
        )),
        OpKind::GetTupleElement { index } => {
            let tuple = operand(operands, 0)?;
            tuple
                .tuple_elements()
                .and_then(|elements| elements.get(*index))
                .cloned()
                .ok_or_else(|| {
                    ServiceError::DeviceError(format!(
                        "cannot take element {} of {}",
                        index,
                        tuple.shape()
                    ))
                })
        }
        other => Err(ServiceError::DeviceError(format!(
            "{} needs a replica context",
            other.name()
        ))),
    }
}

fn operand<'a>(operands: &[&'a Literal], index: usize) -> ServiceResult<&'a Literal> {
    operands
        .get(index)
        .copied()
        .ok_or_else(|| ServiceError::DeviceError(format!("missing operand {}", index)))
}

fn array(literal: &Literal) -> ServiceResult<(ElementType, &[usize], &[f64])> {
    match literal {
        Literal::Array {
            element_type,
            dims,
            values,
            ..
        } => Ok((*element_type, dims, values)),
        Literal::Tuple { .. } => Err(ServiceError::DeviceError(format!(
            "expected an array, got {}",
            literal.shape()
        ))),
    }
}

fn channel_queue(channels: &HashMap<u64, Arc<Channel>>, id: u64) -> ServiceResult<&Arc<FeedQueue>> {
    channels
        .get(&id)
        .map(|channel| &channel.queue)
        .ok_or_else(|| ServiceError::DeviceError(format!("channel {} is not available", id)))
}

fn receive(
    queue: &Arc<FeedQueue>,
    shape: &Shape,
    cancel: &CancelToken,
    source: &str,
) -> ServiceResult<Literal> {
    match queue.pop(Some(shape), None, Some(cancel)) {
        Ok(value) => Ok(value),
        Err(WaitError::Cancelled) => Err(ServiceError::Cancelled),
        Err(WaitError::Mismatch(actual)) => Err(ServiceError::DeviceError(format!(
            "{} value has shape {} but {} was expected",
            source, actual, shape
        ))),
        Err(WaitError::TimedOut) => Err(ServiceError::DeviceError(format!(
            "{} wait timed out",
            source
        ))),
    }
}

fn random_uniform(shape: &Shape, rng: &mut StdRng) -> ServiceResult<Literal> {
    let element_type = shape.element_type().ok_or_else(|| {
        ServiceError::DeviceError(format!("cannot sample a value of shape {}", shape))
    })?;
    let values = (0..shape.element_count()).map(|_| rng.gen::<f64>()).collect();
    Literal::from_values(element_type, shape.dims().to_vec(), values).map_err(device_error)
}

fn apply_unary(op: UnaryOp, v: f64) -> f64 {
    match op {
        UnaryOp::Neg => -v,
        UnaryOp::Abs => v.abs(),
        UnaryOp::Exp => v.exp(),
        UnaryOp::Log => v.ln(),
        UnaryOp::Sqrt => v.sqrt(),
        UnaryOp::Tanh => v.tanh(),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        UnaryOp::Relu => v.max(0.0),
    }
}

fn unary(op: UnaryOp, x: &Literal) -> ServiceResult<Literal> {
    let (element_type, dims, values) = array(x)?;
    Ok(Literal::Array {
        element_type,
        dims: dims.to_vec(),
        layout: None,
        values: values
            .iter()
            .map(|&v| element_type.coerce(apply_unary(op, v)))
            .collect(),
    })
}

fn apply_binary(op: BinaryOp, element_type: ElementType, a: f64, b: f64) -> ServiceResult<f64> {
    let flag = |cond: bool| if cond { 1.0 } else { 0.0 };
    Ok(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide if element_type.is_integral() || element_type == ElementType::Pred => {
            if b == 0.0 {
                return Err(ServiceError::DeviceError(
                    "integer division by zero".to_string(),
                ));
            }
            (a / b).trunc()
        }
        BinaryOp::Divide => a / b,
        BinaryOp::Maximum => a.max(b),
        BinaryOp::Minimum => a.min(b),
        BinaryOp::Power => a.powf(b),
        BinaryOp::Eq => flag(a == b),
        BinaryOp::Lt => flag(a < b),
        BinaryOp::Gt => flag(a > b),
    })
}

fn binary(op: BinaryOp, lhs: &Literal, rhs: &Literal) -> ServiceResult<Literal> {
    let (lhs_type, lhs_dims, lhs_values) = array(lhs)?;
    let (rhs_type, rhs_dims, rhs_values) = array(rhs)?;
    if lhs_type != rhs_type {
        return Err(ServiceError::DeviceError(format!(
            "operand types {} and {} differ",
            lhs_type, rhs_type
        )));
    }

    // Rank-0 operands broadcast against the other side.
    let dims = if lhs_dims == rhs_dims || rhs_dims.is_empty() {
        lhs_dims
    } else if lhs_dims.is_empty() {
        rhs_dims
    } else {
        return Err(ServiceError::DeviceError(format!(
            "operand dims {:?} and {:?} differ",
            lhs_dims, rhs_dims
        )));
    };
    let count: usize = dims.iter().product();
    let pick = |values: &[f64], operand_dims: &[usize], i: usize| {
        if operand_dims.is_empty() {
            values[0]
        } else {
            values[i]
        }
    };

    let result_type = if op.is_comparison() {
        ElementType::Pred
    } else {
        lhs_type
    };
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let a = pick(lhs_values, lhs_dims, i);
        let b = pick(rhs_values, rhs_dims, i);
        values.push(result_type.coerce(apply_binary(op, lhs_type, a, b)?));
    }
    Ok(Literal::Array {
        element_type: result_type,
        dims: dims.to_vec(),
        layout: None,
        values,
    })
}

fn reduce(op: ReduceOp, axes: &[usize], x: &Literal) -> ServiceResult<Literal> {
    let (element_type, dims, values) = array(x)?;
    if let Some(&axis) = axes.iter().find(|&&axis| axis >= dims.len()) {
        return Err(ServiceError::DeviceError(format!(
            "reduction axis {} out of range for rank {}",
            axis,
            dims.len()
        )));
    }
    let reduced: Vec<bool> = (0..dims.len()).map(|axis| axes.contains(&axis)).collect();
    let mut out_dims = Vec::new();
    let mut group = 1usize;
    for (axis, &d) in dims.iter().enumerate() {
        if reduced[axis] {
            group *= d;
        } else {
            out_dims.push(d);
        }
    }

    let mut out_strides = vec![1usize; out_dims.len()];
    for axis in (0..out_dims.len().saturating_sub(1)).rev() {
        out_strides[axis] = out_strides[axis + 1] * out_dims[axis + 1];
    }

    let init = match op {
        ReduceOp::Sum | ReduceOp::Mean => 0.0,
        ReduceOp::Product => 1.0,
        ReduceOp::Max => f64::NEG_INFINITY,
        ReduceOp::Min => f64::INFINITY,
    };
    let mut acc = vec![init; out_dims.iter().product()];

    for (flat, &v) in values.iter().enumerate() {
        let mut rest = flat;
        let mut out_index = 0;
        let mut out_axis = out_dims.len();
        for axis in (0..dims.len()).rev() {
            let coord = rest % dims[axis];
            rest /= dims[axis];
            if !reduced[axis] {
                out_axis -= 1;
                out_index += coord * out_strides[out_axis];
            }
        }
        let slot = &mut acc[out_index];
        *slot = match op {
            ReduceOp::Sum | ReduceOp::Mean => *slot + v,
            ReduceOp::Product => *slot * v,
            ReduceOp::Max => slot.max(v),
            ReduceOp::Min => slot.min(v),
        };
    }

    if op == ReduceOp::Mean {
        for slot in &mut acc {
            *slot /= group as f64;
        }
    }
    Ok(Literal::Array {
        element_type,
        dims: out_dims,
        layout: None,
        values: acc.into_iter().map(|v| element_type.coerce(v)).collect(),
    })
}
