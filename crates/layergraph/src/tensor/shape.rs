//! Symbolic shapes with optional dynamic axes, plus the dtype/shape spec pair.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::dtype::DType;

/// Represents a single axis extent in a symbolic shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    /// Extent fixed at graph construction time.
    Static(usize),
    /// Extent resolved only once concrete tensors are fed (e.g. batch size).
    Dynamic,
}

impl Dimension {
    /// Convenience constructor for static extents.
    pub fn from_usize(value: usize) -> Self {
        Self::Static(value)
    }

    /// Returns `true` when a concrete extent satisfies this dimension.
    pub fn accepts(self, value: usize) -> bool {
        match self {
            Dimension::Static(expected) => expected == value,
            Dimension::Dynamic => true,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(value) => write!(f, "{value}"),
            Dimension::Dynamic => f.write_str("?"),
        }
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Builds a shape from optional extents, `None` marking a dynamic axis.
    pub fn from_dims<I>(dims: I) -> Self
    where
        I: IntoIterator<Item = Option<usize>>,
    {
        Self {
            dims: dims
                .into_iter()
                .map(|dim| match dim {
                    Some(value) => Dimension::Static(value),
                    None => Dimension::Dynamic,
                })
                .collect(),
        }
    }

    /// Builds a fully static shape.
    pub fn fixed<I>(dims: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        Self {
            dims: dims.into_iter().map(Dimension::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<Dimension> {
        self.dims
    }

    /// Returns static extents when every axis is static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when the shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }

    /// Returns `true` when a concrete dim list matches the rank and every
    /// static axis.
    pub fn accepts(&self, dims: &[usize]) -> bool {
        self.dims.len() == dims.len()
            && self
                .dims
                .iter()
                .zip(dims)
                .all(|(dim, value)| dim.accepts(*value))
    }

    /// Returns `true` when two symbolic shapes could describe the same tensor.
    ///
    /// Dynamic axes unify with anything; static axes must agree.
    pub fn compatible_with(&self, other: &Shape) -> bool {
        self.dims.len() == other.dims.len()
            && self.dims.iter().zip(other.dims()).all(|(a, b)| match (a, b) {
                (Dimension::Static(x), Dimension::Static(y)) => x == y,
                _ => true,
            })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Returns total element count when the shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }
}
