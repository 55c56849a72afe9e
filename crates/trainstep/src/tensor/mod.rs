//! Tensor value model: specs, real host tensors, shape-only placeholders,
//! and identity-keyed cells.

mod cell;
mod dtype;
mod fake;
mod host;
mod shape;

pub use cell::{CellId, TensorCell, TensorValue};
pub use dtype::DType;
pub use fake::{FakeMode, FakeTensor, NonFakeInputsGuard};
pub use host::HostTensor;
pub use shape::Shape;

use serde::{Deserialize, Serialize};

/// Logical device a value lives on. The pipeline is single-host; placement
/// across the device grid is a property of the expanded graph, not of specs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
}

/// Static description of a tensor value: element type, shape, and device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
    pub device: Device,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape, device: Device) -> Self {
        TensorSpec {
            dtype,
            shape,
            device,
        }
    }

    /// F32 spec on the default device.
    pub fn f32(shape: Shape) -> Self {
        TensorSpec::new(DType::F32, shape, Device::Cpu)
    }

    /// Spec of the empty placeholder standing in for non-tensor values.
    pub fn empty_placeholder() -> Self {
        TensorSpec::f32(Shape::new([0]))
    }
}

impl std::fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{}", self.dtype, self.shape)
    }
}
