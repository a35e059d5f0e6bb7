//! Primitive element types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of an array value.
///
/// Values of every type are carried as `f64` on the host side and coerced
/// into the representable range of the type when a literal is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    /// Boolean predicate stored as one byte.
    Pred,
    /// Signed 32-bit integer.
    S32,
    /// Unsigned 32-bit integer.
    U32,
    /// IEEE single precision.
    F32,
    /// IEEE double precision.
    F64,
}

impl ElementType {
    pub const ALL: [ElementType; 5] = [
        ElementType::Pred,
        ElementType::S32,
        ElementType::U32,
        ElementType::F32,
        ElementType::F64,
    ];

    /// Size of one element in device memory.
    pub fn byte_width(self) -> usize {
        match self {
            ElementType::Pred => 1,
            ElementType::S32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    pub fn is_integral(self) -> bool {
        matches!(self, ElementType::S32 | ElementType::U32)
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::Pred => "pred",
            ElementType::S32 => "s32",
            ElementType::U32 => "u32",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }

    /// Coerce a host value into the range and precision of this type.
    ///
    /// Integer types truncate toward zero and saturate; `Pred` maps any
    /// non-zero value to 1.
    pub fn coerce(self, value: f64) -> f64 {
        match self {
            ElementType::Pred => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ElementType::S32 => (value as i32) as f64,
            ElementType::U32 => (value as u32) as f64,
            ElementType::F32 => (value as f32) as f64,
            ElementType::F64 => value,
        }
    }

    /// Append the little-endian device encoding of `value`.
    pub fn write_le(self, value: f64, out: &mut Vec<u8>) {
        match self {
            ElementType::Pred => out.push(u8::from(value != 0.0)),
            ElementType::S32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            ElementType::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            ElementType::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            ElementType::F64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
