//! Enumerates the scalar element types carried by tensor specifications.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared by real, fake, and traced values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 16-bit floating point with full mantissa (fp16).
    F16,
    /// 16-bit bfloat16 precision as used by many accelerators.
    BF16,
    /// 32-bit signed integer, primarily for index buffers.
    I32,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I32 => 4,
        }
    }

    /// Whether host kernels can evaluate values of this dtype. The reference
    /// interpreter stores data as f32 and only computes on F32 tensors.
    pub fn is_host_computable(self) -> bool {
        matches!(self, DType::F32)
    }
}
