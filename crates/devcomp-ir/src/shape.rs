//! Shapes and physical layouts.
//!
//! A [`Shape`] is the static type of a value: an array of some element type
//! with fixed dimensions, or a tuple of shapes. The optional [`Layout`] of an
//! array shape describes how the device stores it; host-side values are
//! always kept in logical row-major order.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ElementType, IrError};

/// Physical dimension ordering, from the fastest varying dimension to the
/// slowest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub minor_to_major: Vec<usize>,
}

impl Layout {
    pub fn new(minor_to_major: Vec<usize>) -> Self {
        Layout { minor_to_major }
    }

    /// Row-major (C order): the last dimension is minor.
    pub fn row_major(rank: usize) -> Self {
        Layout {
            minor_to_major: (0..rank).rev().collect(),
        }
    }

    /// Column-major (Fortran order): the first dimension is minor.
    pub fn column_major(rank: usize) -> Self {
        Layout {
            minor_to_major: (0..rank).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.minor_to_major.len()
    }

    pub fn is_row_major(&self) -> bool {
        self.minor_to_major
            .iter()
            .rev()
            .copied()
            .eq(0..self.minor_to_major.len())
    }

    /// Check that the layout is a permutation of `0..rank`.
    pub fn validate(&self, rank: usize) -> Result<(), IrError> {
        let mut seen = vec![false; rank];
        let valid = self.minor_to_major.len() == rank
            && self.minor_to_major.iter().all(|&d| {
                if d < rank && !seen[d] {
                    seen[d] = true;
                    true
                } else {
                    false
                }
            });
        if valid {
            Ok(())
        } else {
            Err(IrError::InvalidLayout {
                rank,
                minor_to_major: self.minor_to_major.clone(),
            })
        }
    }

    /// Element strides of each logical dimension under this layout.
    pub fn strides(&self, dims: &[usize]) -> Vec<usize> {
        let mut strides = vec![0; dims.len()];
        let mut acc = 1;
        for &dim in &self.minor_to_major {
            strides[dim] = acc;
            acc *= dims[dim].max(1);
        }
        strides
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.minor_to_major.iter().map(|d| d.to_string()).collect();
        write!(f, "{{{}}}", dims.join(","))
    }
}

/// Static type descriptor of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    Array {
        element_type: ElementType,
        dims: Vec<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        layout: Option<Layout>,
    },
    Tuple {
        elements: Vec<Shape>,
    },
}

impl Shape {
    pub fn array(element_type: ElementType, dims: impl Into<Vec<usize>>) -> Self {
        Shape::Array {
            element_type,
            dims: dims.into(),
            layout: None,
        }
    }

    pub fn scalar(element_type: ElementType) -> Self {
        Self::array(element_type, Vec::new())
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple { elements }
    }

    /// The empty tuple, used as the result of side-effecting operations.
    pub fn unit() -> Self {
        Shape::Tuple {
            elements: Vec::new(),
        }
    }

    /// Attach a layout to an array shape. Tuples are returned unchanged.
    pub fn with_layout(self, layout: Layout) -> Self {
        match self {
            Shape::Array {
                element_type, dims, ..
            } => Shape::Array {
                element_type,
                dims,
                layout: Some(layout),
            },
            tuple => tuple,
        }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Shape::Array { .. })
    }

    pub fn element_type(&self) -> Option<ElementType> {
        match self {
            Shape::Array { element_type, .. } => Some(*element_type),
            Shape::Tuple { .. } => None,
        }
    }

    /// Dimensions of an array shape; empty for tuples.
    pub fn dims(&self) -> &[usize] {
        match self {
            Shape::Array { dims, .. } => dims,
            Shape::Tuple { .. } => &[],
        }
    }

    pub fn layout(&self) -> Option<&Layout> {
        match self {
            Shape::Array { layout, .. } => layout.as_ref(),
            Shape::Tuple { .. } => None,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims().len()
    }

    pub fn tuple_elements(&self) -> Option<&[Shape]> {
        match self {
            Shape::Tuple { elements } => Some(elements),
            Shape::Array { .. } => None,
        }
    }

    /// Number of array elements; tuples count the elements of their leaves.
    ///
    /// Saturates at `usize::MAX`; validated shapes never reach it.
    pub fn element_count(&self) -> usize {
        self.checked_element_count().unwrap_or(usize::MAX)
    }

    /// Device footprint in bytes, saturating like [`Shape::element_count`].
    pub fn byte_size(&self) -> usize {
        self.checked_byte_size().unwrap_or(usize::MAX)
    }

    pub fn checked_element_count(&self) -> Option<usize> {
        match self {
            Shape::Array { dims, .. } => checked_product(dims),
            Shape::Tuple { elements } => elements
                .iter()
                .try_fold(0usize, |acc, e| acc.checked_add(e.checked_element_count()?)),
        }
    }

    /// Device footprint in bytes, or `None` when it does not fit in `usize`.
    pub fn checked_byte_size(&self) -> Option<usize> {
        match self {
            Shape::Array {
                element_type, dims, ..
            } => checked_product(dims)?.checked_mul(element_type.byte_width()),
            Shape::Tuple { elements } => elements
                .iter()
                .try_fold(0usize, |acc, e| acc.checked_add(e.checked_byte_size()?)),
        }
    }

    /// Every element type appearing in the shape.
    pub fn element_types(&self) -> Vec<ElementType> {
        let mut out = Vec::new();
        self.collect_element_types(&mut out);
        out
    }

    fn collect_element_types(&self, out: &mut Vec<ElementType>) {
        match self {
            Shape::Array { element_type, .. } => {
                if !out.contains(element_type) {
                    out.push(*element_type);
                }
            }
            Shape::Tuple { elements } => {
                for element in elements {
                    element.collect_element_types(out);
                }
            }
        }
    }

    /// Copy of the shape with every missing layout set to row-major.
    pub fn normalized(&self) -> Shape {
        match self {
            Shape::Array {
                element_type,
                dims,
                layout,
            } => Shape::Array {
                element_type: *element_type,
                dims: dims.clone(),
                layout: Some(
                    layout
                        .clone()
                        .unwrap_or_else(|| Layout::row_major(dims.len())),
                ),
            },
            Shape::Tuple { elements } => Shape::Tuple {
                elements: elements.iter().map(Shape::normalized).collect(),
            },
        }
    }

    /// Same element types and dimensions, ignoring layouts.
    pub fn compatible(&self, other: &Shape) -> bool {
        match (self, other) {
            (
                Shape::Array {
                    element_type: a,
                    dims: da,
                    ..
                },
                Shape::Array {
                    element_type: b,
                    dims: db,
                    ..
                },
            ) => a == b && da == db,
            (Shape::Tuple { elements: a }, Shape::Tuple { elements: b }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.compatible(y))
            }
            _ => false,
        }
    }

    /// Check every layout in the shape and that its byte size is addressable.
    pub fn validate(&self) -> Result<(), IrError> {
        self.validate_layouts()?;
        match self.checked_byte_size() {
            Some(_) => Ok(()),
            None => Err(IrError::ShapeTooLarge(self.to_string())),
        }
    }

    fn validate_layouts(&self) -> Result<(), IrError> {
        match self {
            Shape::Array { dims, layout, .. } => match layout {
                Some(layout) => layout.validate(dims.len()),
                None => Ok(()),
            },
            Shape::Tuple { elements } => elements.iter().try_for_each(Shape::validate_layouts),
        }
    }
}

/// Product of `dims`, or `None` when it overflows `usize`.
pub fn checked_product(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array {
                element_type,
                dims,
                layout,
            } => {
                let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "{}[{}]", element_type, dims.join(","))?;
                if let Some(layout) = layout {
                    write!(f, "{}", layout)?;
                }
                Ok(())
            }
            Shape::Tuple { elements } => {
                let parts: Vec<String> = elements.iter().map(|s| s.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_layout() {
        let layout = Layout::row_major(3);
        assert_eq!(layout.minor_to_major, vec![2, 1, 0]);
        assert!(layout.is_row_major());
        assert!(!Layout::column_major(3).is_row_major());
        assert!(Layout::row_major(0).is_row_major());
    }

    #[test]
    fn test_layout_validation() {
        assert!(Layout::new(vec![1, 0]).validate(2).is_ok());
        assert!(Layout::new(vec![1, 1]).validate(2).is_err());
        assert!(Layout::new(vec![0]).validate(2).is_err());
        assert!(Layout::new(vec![2, 0]).validate(2).is_err());
    }

    #[test]
    fn test_strides() {
        assert_eq!(Layout::row_major(2).strides(&[2, 3]), vec![3, 1]);
        assert_eq!(Layout::column_major(2).strides(&[2, 3]), vec![1, 2]);
    }

    #[test]
    fn test_normalized_equality() {
        let a = Shape::array(ElementType::F32, vec![2, 3]);
        let b = a.clone().with_layout(Layout::row_major(2));
        assert_ne!(a, b);
        assert_eq!(a.normalized(), b.normalized());

        let c = a.clone().with_layout(Layout::column_major(2));
        assert_ne!(a.normalized(), c.normalized());
        assert!(a.compatible(&c));
    }

    #[test]
    fn test_byte_size_and_count() {
        let shape = Shape::tuple(vec![
            Shape::array(ElementType::F64, vec![2, 2]),
            Shape::scalar(ElementType::Pred),
        ]);
        assert_eq!(shape.element_count(), 5);
        assert_eq!(shape.byte_size(), 33);
        assert_eq!(
            shape.element_types(),
            vec![ElementType::F64, ElementType::Pred]
        );
    }

    #[test]
    fn test_overflowing_shapes_rejected() {
        let huge = Shape::array(ElementType::F32, vec![1 << 33, 1 << 33, 0]);
        assert_eq!(huge.checked_element_count(), None);
        assert_eq!(huge.element_count(), usize::MAX);
        assert!(matches!(huge.validate(), Err(IrError::ShapeTooLarge(_))));

        let wide = Shape::array(ElementType::F64, vec![usize::MAX / 4]);
        assert!(wide.checked_element_count().is_some());
        assert_eq!(wide.checked_byte_size(), None);
        assert!(wide.validate().is_err());

        let pair = Shape::tuple(vec![
            Shape::array(ElementType::Pred, vec![usize::MAX]),
            Shape::scalar(ElementType::Pred),
        ]);
        assert!(matches!(pair.validate(), Err(IrError::ShapeTooLarge(_))));
        assert!(Shape::array(ElementType::F32, vec![0, 1 << 62]).validate().is_ok());
    }

    #[test]
    fn test_display() {
        let shape = Shape::tuple(vec![
            Shape::array(ElementType::F32, vec![2, 3]).with_layout(Layout::row_major(2)),
            Shape::scalar(ElementType::S32),
        ]);
        assert_eq!(shape.to_string(), "(f32[2,3]{1,0}, s32[])");
    }

    #[test]
    fn test_serde_round_trip() {
        let shape = Shape::array(ElementType::U32, vec![4]).with_layout(Layout::row_major(1));
        let json = serde_json::to_string(&shape).unwrap();
        let back: Shape = serde_json::from_str(&json).unwrap();
        assert_eq!(shape, back);
    }
}
