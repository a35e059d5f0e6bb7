//! Device-resident buffers.

use devcomp_ir::{Literal, Shape};
use std::sync::Arc;

/// Contents of one piece of device memory.
///
/// Tuple buffers hold their elements behind `Arc` so element handles
/// produced by deconstruction alias the parent's storage.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceBuffer {
    Array(Literal),
    Tuple(Vec<Arc<DeviceBuffer>>),
}

impl DeviceBuffer {
    pub fn from_literal(literal: Literal) -> Arc<Self> {
        match literal {
            Literal::Tuple { elements } => Arc::new(DeviceBuffer::Tuple(
                elements.into_iter().map(DeviceBuffer::from_literal).collect(),
            )),
            array => Arc::new(DeviceBuffer::Array(array)),
        }
    }

    pub fn to_literal(&self) -> Literal {
        match self {
            DeviceBuffer::Array(literal) => literal.clone(),
            DeviceBuffer::Tuple(elements) => {
                Literal::tuple(elements.iter().map(|e| e.to_literal()).collect())
            }
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            DeviceBuffer::Array(literal) => literal.shape(),
            DeviceBuffer::Tuple(elements) => {
                Shape::tuple(elements.iter().map(|e| e.shape()).collect())
            }
        }
    }

    pub fn elements(&self) -> Option<&[Arc<DeviceBuffer>]> {
        match self {
            DeviceBuffer::Tuple(elements) => Some(elements),
            DeviceBuffer::Array(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcomp_ir::ElementType;

    #[test]
    fn test_tuple_elements_are_shared() {
        let literal = Literal::tuple(vec![Literal::s32(1), Literal::f32(2.0)]);
        let buffer = DeviceBuffer::from_literal(literal.clone());
        assert_eq!(buffer.to_literal(), literal);
        let elements = buffer.elements().unwrap();
        let alias = Arc::clone(&elements[0]);
        assert_eq!(Arc::strong_count(&elements[0]), 2);
        assert_eq!(alias.shape(), Shape::scalar(ElementType::S32));
    }
}
