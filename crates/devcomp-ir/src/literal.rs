//! Host-representable values.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::shape::checked_product;
use crate::{ElementType, IrError, Layout, Shape};

/// A value held on the host, used to move data into and out of devices.
///
/// Array values are stored in logical row-major order regardless of the
/// layout recorded for the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Literal {
    Array {
        element_type: ElementType,
        dims: Vec<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        layout: Option<Layout>,
        values: Vec<f64>,
    },
    Tuple {
        elements: Vec<Literal>,
    },
}

impl Literal {
    /// Build an array literal, coercing values to the element type.
    pub fn from_values(
        element_type: ElementType,
        dims: impl Into<Vec<usize>>,
        values: Vec<f64>,
    ) -> Result<Self, IrError> {
        let dims = dims.into();
        let expected = checked_product(&dims).ok_or_else(|| {
            IrError::ShapeTooLarge(Shape::array(element_type, dims.clone()).to_string())
        })?;
        if values.len() != expected {
            return Err(IrError::ElementCountMismatch {
                expected,
                actual: values.len(),
            });
        }
        Ok(Literal::Array {
            element_type,
            dims,
            layout: None,
            values: values.into_iter().map(|v| element_type.coerce(v)).collect(),
        })
    }

    pub fn scalar(element_type: ElementType, value: f64) -> Self {
        Literal::Array {
            element_type,
            dims: Vec::new(),
            layout: None,
            values: vec![element_type.coerce(value)],
        }
    }

    pub fn vector(element_type: ElementType, values: &[f64]) -> Self {
        Literal::Array {
            element_type,
            dims: vec![values.len()],
            layout: None,
            values: values.iter().map(|&v| element_type.coerce(v)).collect(),
        }
    }

    pub fn f32(value: f32) -> Self {
        Self::scalar(ElementType::F32, value as f64)
    }

    pub fn s32(value: i32) -> Self {
        Self::scalar(ElementType::S32, value as f64)
    }

    pub fn pred(value: bool) -> Self {
        Self::scalar(ElementType::Pred, if value { 1.0 } else { 0.0 })
    }

    pub fn tuple(elements: Vec<Literal>) -> Self {
        Literal::Tuple { elements }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Literal::Array {
                element_type,
                dims,
                layout,
                ..
            } => Shape::Array {
                element_type: *element_type,
                dims: dims.clone(),
                layout: layout.clone(),
            },
            Literal::Tuple { elements } => Shape::Tuple {
                elements: elements.iter().map(Literal::shape).collect(),
            },
        }
    }

    pub fn values(&self) -> Option<&[f64]> {
        match self {
            Literal::Array { values, .. } => Some(values),
            Literal::Tuple { .. } => None,
        }
    }

    pub fn tuple_elements(&self) -> Option<&[Literal]> {
        match self {
            Literal::Tuple { elements } => Some(elements),
            Literal::Array { .. } => None,
        }
    }

    /// The single value of a rank-0 or one-element array.
    pub fn get_scalar(&self) -> Option<f64> {
        match self {
            Literal::Array { values, .. } if values.len() == 1 => Some(values[0]),
            _ => None,
        }
    }

    /// Check value counts and layouts of the literal and all its elements.
    pub fn validate(&self) -> Result<(), IrError> {
        match self {
            Literal::Array { dims, values, .. } => {
                self.shape().validate()?;
                let expected = checked_product(dims)
                    .ok_or_else(|| IrError::ShapeTooLarge(self.shape().to_string()))?;
                if values.len() != expected {
                    return Err(IrError::ElementCountMismatch {
                        expected,
                        actual: values.len(),
                    });
                }
                Ok(())
            }
            Literal::Tuple { elements } => elements.iter().try_for_each(Literal::validate),
        }
    }

    /// Copy with every value coerced to its element type.
    pub fn coerced(&self) -> Literal {
        match self {
            Literal::Array {
                element_type,
                dims,
                layout,
                values,
            } => Literal::Array {
                element_type: *element_type,
                dims: dims.clone(),
                layout: layout.clone(),
                values: values.iter().map(|&v| element_type.coerce(v)).collect(),
            },
            Literal::Tuple { elements } => Literal::Tuple {
                elements: elements.iter().map(Literal::coerced).collect(),
            },
        }
    }

    /// Reinterpret the literal under another shape with the same element
    /// type and element count, adopting the shape's dims and layout.
    pub fn relayout(&self, target: &Shape) -> Result<Literal, IrError> {
        target.validate()?;
        match (self, target) {
            (
                Literal::Array {
                    element_type,
                    values,
                    ..
                },
                Shape::Array {
                    element_type: target_type,
                    dims,
                    layout,
                },
            ) => {
                if element_type != target_type {
                    return Err(IrError::ElementTypeMismatch {
                        expected: *element_type,
                        actual: *target_type,
                    });
                }
                let expected = target.element_count();
                if expected != values.len() {
                    return Err(IrError::ElementCountMismatch {
                        expected: values.len(),
                        actual: expected,
                    });
                }
                Ok(Literal::Array {
                    element_type: *element_type,
                    dims: dims.clone(),
                    layout: layout.clone(),
                    values: values.clone(),
                })
            }
            (Literal::Tuple { elements }, Shape::Tuple { elements: targets })
                if elements.len() == targets.len() =>
            {
                let elements = elements
                    .iter()
                    .zip(targets)
                    .map(|(literal, shape)| literal.relayout(shape))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Literal::Tuple { elements })
            }
            _ => Err(IrError::LayoutMismatch(format!(
                "cannot lay out {} as {}",
                self.shape(),
                target
            ))),
        }
    }

    /// Little-endian device encoding of every leaf, in order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.shape().checked_byte_size().unwrap_or(0));
        self.write_le(&mut out);
        out
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        match self {
            Literal::Array {
                element_type,
                values,
                ..
            } => {
                for &v in values {
                    element_type.write_le(v, out);
                }
            }
            Literal::Tuple { elements } => {
                for element in elements {
                    element.write_le(out);
                }
            }
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Array { values, .. } => {
                write!(f, "{} ", self.shape())?;
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                if parts.len() == 1 && self.shape().rank() == 0 {
                    write!(f, "{}", parts[0])
                } else {
                    write!(f, "{{{}}}", parts.join(", "))
                }
            }
            Literal::Tuple { elements } => {
                let parts: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}
