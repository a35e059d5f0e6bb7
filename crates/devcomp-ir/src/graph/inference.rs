//! Result shape inference for graph operations.

use crate::{ElementType, IrError, Shape};

use super::OpKind;

fn fail(op: &OpKind, reason: impl Into<String>) -> IrError {
    IrError::ShapeInference {
        op: op.name().to_string(),
        reason: reason.into(),
    }
}

fn expect_array<'a>(op: &OpKind, shape: &'a Shape) -> Result<(ElementType, &'a [usize]), IrError> {
    match shape {
        Shape::Array {
            element_type, dims, ..
        } => Ok((*element_type, dims)),
        Shape::Tuple { .. } => Err(fail(op, format!("expected an array operand, got {}", shape))),
    }
}

/// Infer the result shape of `op` applied to operands of the given shapes.
///
/// Inferred array shapes carry no layout.
pub fn infer_shape(op: &OpKind, operands: &[&Shape]) -> Result<Shape, IrError> {
    if let Some(expected) = op.arity() {
        if expected != operands.len() {
            return Err(IrError::OperandCount {
                op: op.name().to_string(),
                expected,
                actual: operands.len(),
            });
        }
    }

    match op {
        OpKind::Parameter { shape, .. } | OpKind::Infeed { shape } | OpKind::Recv { shape, .. } => {
            shape.validate()?;
            Ok(shape.clone())
        }
        OpKind::Constant { literal } => {
            literal.validate()?;
            Ok(literal.shape())
        }
        OpKind::Unary { .. } => {
            let (ty, dims) = expect_array(op, operands[0])?;
            if ty == ElementType::Pred {
                return Err(fail(op, "unary arithmetic is not defined on pred"));
            }
            Ok(Shape::array(ty, dims))
        }
        OpKind::Binary { op: binary } => {
            let (lhs_ty, lhs_dims) = expect_array(op, operands[0])?;
            let (rhs_ty, rhs_dims) = expect_array(op, operands[1])?;
            if lhs_ty != rhs_ty {
                return Err(IrError::ElementTypeMismatch {
                    expected: lhs_ty,
                    actual: rhs_ty,
                });
            }
            let dims = if lhs_dims == rhs_dims || rhs_dims.is_empty() {
                lhs_dims
            } else if lhs_dims.is_empty() {
                rhs_dims
            } else {
                return Err(fail(
                    op,
                    format!("operand dims {:?} and {:?} differ", lhs_dims, rhs_dims),
                ));
            };
            let ty = if binary.is_comparison() {
                ElementType::Pred
            } else {
                lhs_ty
            };
            Ok(Shape::array(ty, dims))
        }
        OpKind::Reduce { axes, .. } => {
            let (ty, dims) = expect_array(op, operands[0])?;
            let mut seen = vec![false; dims.len()];
            for &axis in axes {
                if axis >= dims.len() || seen[axis] {
                    return Err(fail(
                        op,
                        format!("invalid axis {} for rank {}", axis, dims.len()),
                    ));
                }
                seen[axis] = true;
            }
            let kept: Vec<usize> = dims
                .iter()
                .enumerate()
                .filter(|(i, _)| !seen[*i])
                .map(|(_, &d)| d)
                .collect();
            Ok(Shape::array(ty, kept))
        }
        OpKind::Reshape { dims } => {
            let (ty, _) = expect_array(op, operands[0])?;
            let reshaped = Shape::array(ty, dims.clone());
            reshaped.validate()?;
            let before = operands[0]
                .checked_element_count()
                .ok_or_else(|| IrError::ShapeTooLarge(operands[0].to_string()))?;
            let after = reshaped.element_count();
            if before != after {
                return Err(IrError::ElementCountMismatch {
                    expected: before,
                    actual: after,
                });
            }
            Ok(reshaped)
        }
        OpKind::Tuple => {
            let tuple = Shape::tuple(operands.iter().map(|s| (*s).clone()).collect());
            tuple.validate()?;
            Ok(tuple)
        }
        OpKind::GetTupleElement { index } => match operands[0] {
            Shape::Tuple { elements } => elements.get(*index).cloned().ok_or_else(|| {
                fail(
                    op,
                    format!("index {} out of range for {}-tuple", index, elements.len()),
                )
            }),
            other => Err(fail(op, format!("operand {} is not a tuple", other))),
        },
        OpKind::Outfeed | OpKind::Send { .. } => Ok(Shape::unit()),
        OpKind::ReplicaId => Ok(Shape::scalar(ElementType::U32)),
        OpKind::RngUniform { shape } => {
            shape.validate()?;
            match shape.element_type() {
                Some(ty) if ty.is_float() => Ok(shape.clone()),
                _ => Err(fail(op, format!("{} is not a floating-point array", shape))),
            }
        }
    }
}
