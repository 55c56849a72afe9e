//! Dense host tensors with the f32 kernels used by the reference executor.

use anyhow::{ensure, Result};
use rand::Rng;

use super::{DType, Device, Shape, TensorSpec};

/// A real tensor living in host memory. Storage is always f32; the spec's
/// dtype records the logical element type.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    spec: TensorSpec,
    data: Vec<f32>,
}

impl HostTensor {
    /// Constructs a tensor from raw data, validating the element count.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        ensure!(
            shape.num_elements() == data.len(),
            "shape {} expects {} elements, got {}",
            shape,
            shape.num_elements(),
            data.len()
        );
        Ok(HostTensor {
            spec: TensorSpec::new(DType::F32, shape, Device::Cpu),
            data,
        })
    }

    /// An all-zero tensor matching `spec`.
    pub fn zeros(spec: TensorSpec) -> Self {
        let len = spec.shape.num_elements();
        HostTensor {
            spec,
            data: vec![0.0; len],
        }
    }

    /// A scalar (0-dimensional) tensor.
    pub fn scalar(value: f32) -> Self {
        HostTensor {
            spec: TensorSpec::new(DType::F32, Shape::scalar(), Device::Cpu),
            data: vec![value],
        }
    }

    /// Uniform random init in [-1, 1), seeded by the caller's rng.
    pub fn rand_uniform<R: Rng>(shape: Shape, rng: &mut R) -> Self {
        let len = shape.num_elements();
        let data = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
        HostTensor {
            spec: TensorSpec::new(DType::F32, shape, Device::Cpu),
            data,
        }
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|v| *v == 0.0)
    }

    /// Elementwise comparison within an absolute tolerance.
    pub fn allclose(&self, other: &HostTensor, tol: f32) -> bool {
        self.spec == other.spec
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
    }

    /// Overwrites this tensor's contents with `src`'s, requiring equal specs.
    pub fn copy_from(&mut self, src: &HostTensor) -> Result<()> {
        ensure!(
            self.spec == src.spec,
            "copy requires matching specs: {} vs {}",
            self.spec,
            src.spec
        );
        self.data.copy_from_slice(&src.data);
        Ok(())
    }

    fn zip_with(&self, rhs: &HostTensor, f: impl Fn(f32, f32) -> f32) -> Result<HostTensor> {
        ensure!(
            self.spec == rhs.spec,
            "elementwise operands must match: {} vs {}",
            self.spec,
            rhs.spec
        );
        let data = self
            .data
            .iter()
            .zip(rhs.data.iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Ok(HostTensor {
            spec: self.spec.clone(),
            data,
        })
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> HostTensor {
        HostTensor {
            spec: self.spec.clone(),
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    pub fn add(&self, rhs: &HostTensor) -> Result<HostTensor> {
        self.zip_with(rhs, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &HostTensor) -> Result<HostTensor> {
        self.zip_with(rhs, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &HostTensor) -> Result<HostTensor> {
        self.zip_with(rhs, |a, b| a * b)
    }

    pub fn div(&self, rhs: &HostTensor) -> Result<HostTensor> {
        self.zip_with(rhs, |a, b| a / b)
    }

    pub fn neg(&self) -> HostTensor {
        self.map(|v| -v)
    }

    pub fn add_scalar(&self, value: f32) -> HostTensor {
        self.map(|v| v + value)
    }

    pub fn mul_scalar(&self, value: f32) -> HostTensor {
        self.map(|v| v * value)
    }

    /// Naive 2-D matrix product `[m,k] x [k,n] -> [m,n]`.
    pub fn matmul(&self, rhs: &HostTensor) -> Result<HostTensor> {
        let (ld, rd) = (self.shape().dims(), rhs.shape().dims());
        ensure!(
            ld.len() == 2 && rd.len() == 2,
            "matmul expects rank-2 operands, got {} and {}",
            self.shape(),
            rhs.shape()
        );
        ensure!(
            ld[1] == rd[0],
            "matmul contraction mismatch: {} vs {}",
            self.shape(),
            rhs.shape()
        );
        let (m, k, n) = (ld[0], ld[1], rd[1]);
        let mut data = vec![0.0; m * n];
        for i in 0..m {
            for p in 0..k {
                let a = self.data[i * k + p];
                for j in 0..n {
                    data[i * n + j] += a * rhs.data[p * n + j];
                }
            }
        }
        HostTensor::from_vec(Shape::new([m, n]), data)
    }

    /// 2-D transpose.
    pub fn transpose(&self) -> Result<HostTensor> {
        let dims = self.shape().dims();
        ensure!(
            dims.len() == 2,
            "transpose expects a rank-2 operand, got {}",
            self.shape()
        );
        let (m, n) = (dims[0], dims[1]);
        let mut data = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                data[j * m + i] = self.data[i * n + j];
            }
        }
        HostTensor::from_vec(Shape::new([n, m]), data)
    }

    /// Full reduction to a scalar sum.
    pub fn sum(&self) -> HostTensor {
        HostTensor::scalar(self.data.iter().sum())
    }

    /// Full reduction to a scalar mean.
    pub fn mean(&self) -> Result<HostTensor> {
        ensure!(!self.data.is_empty(), "mean of an empty tensor is undefined");
        Ok(HostTensor::scalar(
            self.data.iter().sum::<f32>() / self.data.len() as f32,
        ))
    }
}
