//! Host-backed tensor passed between layer forward calls.

use anyhow::{bail, ensure, Result};
use rand::Rng;
use std::sync::Arc;

use super::{DType, Shape, TensorSpec};

/// Immutable host tensor with reference-counted storage.
///
/// Cloning bumps a reference count and never copies the payload, so feeds
/// and the executor's working set can share one allocation per value.
#[derive(Debug, Clone)]
pub struct Tensor {
    dims: Vec<usize>,
    data: TensorData,
}

#[derive(Debug, Clone)]
enum TensorData {
    F32(Arc<[f32]>),
    I32(Arc<[i32]>),
    Bool(Arc<[bool]>),
}

impl Tensor {
    /// Constructs an `F32` tensor, validating the length against the dims.
    pub fn from_vec(dims: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        let dims = dims.into();
        ensure!(
            data.len() == dims.iter().product::<usize>(),
            "tensor data length ({}) does not match dims {:?}",
            data.len(),
            dims
        );
        Ok(Tensor {
            dims,
            data: TensorData::F32(Arc::from(data)),
        })
    }

    /// Constructs an `I32` tensor, validating the length against the dims.
    pub fn from_i32(dims: impl Into<Vec<usize>>, data: Vec<i32>) -> Result<Self> {
        let dims = dims.into();
        ensure!(
            data.len() == dims.iter().product::<usize>(),
            "tensor data length ({}) does not match dims {:?}",
            data.len(),
            dims
        );
        Ok(Tensor {
            dims,
            data: TensorData::I32(Arc::from(data)),
        })
    }

    /// Constructs a `Bool` tensor, validating the length against the dims.
    pub fn from_bool(dims: impl Into<Vec<usize>>, data: Vec<bool>) -> Result<Self> {
        let dims = dims.into();
        ensure!(
            data.len() == dims.iter().product::<usize>(),
            "tensor data length ({}) does not match dims {:?}",
            data.len(),
            dims
        );
        Ok(Tensor {
            dims,
            data: TensorData::Bool(Arc::from(data)),
        })
    }

    /// Returns a zero-initialized `F32` tensor of the requested dims.
    pub fn zeros(dims: impl Into<Vec<usize>>) -> Self {
        Self::filled(dims, 0.0)
    }

    /// Returns a one-initialized `F32` tensor of the requested dims.
    pub fn ones(dims: impl Into<Vec<usize>>) -> Self {
        Self::filled(dims, 1.0)
    }

    /// Returns a constant `F32` tensor of the requested dims.
    pub fn filled(dims: impl Into<Vec<usize>>, value: f32) -> Self {
        let dims = dims.into();
        let len = dims.iter().product();
        Tensor {
            dims,
            data: TensorData::F32(Arc::from(vec![value; len])),
        }
    }

    /// Samples `N(0, std^2)` values using the Box-Muller transform.
    pub fn randn(dims: impl Into<Vec<usize>>, std: f32, rng: &mut impl Rng) -> Self {
        let dims = dims.into();
        let len = dims.iter().product();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            let z0 = r * theta.cos() * std;
            let z1 = r * theta.sin() * std;
            values.push(z0);
            if values.len() < len {
                values.push(z1);
            }
        }
        Tensor {
            dims,
            data: TensorData::F32(Arc::from(values)),
        }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the concrete dimension list.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the scalar dtype of the tensor payload.
    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    /// Describes the tensor as a fully static symbolic spec.
    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype(), Shape::fixed(self.dims.iter().copied()))
    }

    /// Borrows the `f32` payload, failing when the dtype differs.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Ok(values),
            _ => bail!("tensor holds {} data, not f32", self.dtype()),
        }
    }

    /// Borrows the `i32` payload, failing when the dtype differs.
    pub fn as_i32(&self) -> Result<&[i32]> {
        match &self.data {
            TensorData::I32(values) => Ok(values),
            _ => bail!("tensor holds {} data, not i32", self.dtype()),
        }
    }

    /// Borrows the `bool` payload, failing when the dtype differs.
    pub fn as_bool(&self) -> Result<&[bool]> {
        match &self.data {
            TensorData::Bool(values) => Ok(values),
            _ => bail!("tensor holds {} data, not bool", self.dtype()),
        }
    }

    /// Returns a tensor with new dims sharing the same storage.
    pub fn reshaped(&self, dims: impl Into<Vec<usize>>) -> Result<Tensor> {
        let dims = dims.into();
        ensure!(
            dims.iter().product::<usize>() == self.len(),
            "cannot reshape {} elements into dims {:?}",
            self.len(),
            dims
        );
        Ok(Tensor {
            dims,
            data: self.data.clone(),
        })
    }

    /// Casts to `target` along the safe widening lattice, cloning storage
    /// only when the dtype actually changes.
    pub fn cast(&self, target: DType) -> Result<Tensor> {
        if self.dtype() == target {
            return Ok(self.clone());
        }
        ensure!(
            self.dtype().casts_to(target),
            "no safe cast from {} to {}",
            self.dtype(),
            target
        );
        let data = match (&self.data, target) {
            (TensorData::Bool(values), DType::I32) => {
                TensorData::I32(values.iter().map(|&v| v as i32).collect())
            }
            (TensorData::Bool(values), DType::F32) => {
                TensorData::F32(values.iter().map(|&v| v as i32 as f32).collect())
            }
            (TensorData::I32(values), DType::F32) => {
                TensorData::F32(values.iter().map(|&v| v as f32).collect())
            }
            _ => bail!("no safe cast from {} to {}", self.dtype(), target),
        };
        Ok(Tensor {
            dims: self.dims.clone(),
            data,
        })
    }

    /// Applies a unary function over every `f32` element into a new tensor.
    pub fn map<F>(&self, mut f: F) -> Result<Tensor>
    where
        F: FnMut(f32) -> f32,
    {
        let values = self.as_f32()?;
        Ok(Tensor {
            dims: self.dims.clone(),
            data: TensorData::F32(values.iter().map(|&v| f(v)).collect()),
        })
    }

    /// Combines two same-shaped `f32` tensors elementwise into a new tensor.
    pub fn zip_map<F>(&self, rhs: &Tensor, mut f: F) -> Result<Tensor>
    where
        F: FnMut(f32, f32) -> f32,
    {
        ensure!(
            self.dims == rhs.dims,
            "elementwise shapes differ: {:?} vs {:?}",
            self.dims,
            rhs.dims
        );
        let lhs = self.as_f32()?;
        let other = rhs.as_f32()?;
        Ok(Tensor {
            dims: self.dims.clone(),
            data: TensorData::F32(lhs.iter().zip(other).map(|(&a, &b)| f(a, b)).collect()),
        })
    }

    /// Multiplies two rank-2 `f32` tensors.
    pub fn matmul2d(&self, rhs: &Tensor) -> Result<Tensor> {
        ensure!(
            self.dims.len() == 2 && rhs.dims.len() == 2,
            "matmul2d requires rank-2 operands, got {:?} and {:?}",
            self.dims,
            rhs.dims
        );
        let (m, k) = (self.dims[0], self.dims[1]);
        let (rk, n) = (rhs.dims[0], rhs.dims[1]);
        ensure!(
            k == rk,
            "matmul2d inner dimensions differ: {:?} x {:?}",
            self.dims,
            rhs.dims
        );
        let lhs = self.as_f32()?;
        let other = rhs.as_f32()?;
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for p in 0..k {
                let a = lhs[i * k + p];
                for j in 0..n {
                    out[i * n + j] += a * other[p * n + j];
                }
            }
        }
        Tensor::from_vec([m, n], out)
    }

    /// Concatenates `f32` tensors along `axis`; every other axis must agree.
    pub fn concat(parts: &[Tensor], axis: usize) -> Result<Tensor> {
        ensure!(!parts.is_empty(), "concat requires at least one operand");
        let first = &parts[0];
        let rank = first.dims.len();
        ensure!(
            axis < rank,
            "concat axis {} out of range for rank {}",
            axis,
            rank
        );
        for part in &parts[1..] {
            ensure!(
                part.dims.len() == rank,
                "concat operands disagree on rank: {:?} vs {:?}",
                first.dims,
                part.dims
            );
            for (i, (a, b)) in first.dims.iter().zip(part.dims.iter()).enumerate() {
                ensure!(
                    i == axis || a == b,
                    "concat operands disagree on axis {}: {:?} vs {:?}",
                    i,
                    first.dims,
                    part.dims
                );
            }
        }
        let outer: usize = first.dims[..axis].iter().product();
        let inner: usize = first.dims[axis + 1..].iter().product();
        let joined: usize = parts.iter().map(|part| part.dims[axis]).sum();
        let mut out = Vec::with_capacity(outer * joined * inner);
        for o in 0..outer {
            for part in parts {
                let span = part.dims[axis] * inner;
                let data = part.as_f32()?;
                out.extend_from_slice(&data[o * span..(o + 1) * span]);
            }
        }
        let mut dims = first.dims.clone();
        dims[axis] = joined;
        Tensor::from_vec(dims, out)
    }
}
