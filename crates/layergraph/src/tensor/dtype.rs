//! Enumerates the scalar element types carried by graph values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical dtype identifier shared between symbolic values and host tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 32-bit signed integer, primarily for index and mask data.
    I32,
    /// Boolean flags stored one byte per element.
    Bool,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::Bool => 1,
        }
    }

    /// Returns `true` when a safe widening cast from `self` to `target` exists.
    ///
    /// The lattice is `Bool -> I32 -> F32`; every dtype casts to itself.
    pub fn casts_to(self, target: DType) -> bool {
        matches!(
            (self, target),
            (DType::F32, DType::F32)
                | (DType::I32, DType::I32)
                | (DType::Bool, DType::Bool)
                | (DType::Bool, DType::I32)
                | (DType::Bool, DType::F32)
                | (DType::I32, DType::F32)
        )
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}
