//! Weight enumeration and assignment via dotted-path visitors.
//!
//! Layers expose their weights to external loaders through read and mutate
//! visitors; paths are dot-joined segments scoped by layer name so a flat
//! (name, dims, dtype) index addresses every weight in a network.

use crate::error::{Error, Result};
use crate::tensor::{DType, Tensor};

pub type VisitWeightsFn<'a> = dyn FnMut(&str, WeightRole, &Tensor) -> Result<()> + 'a;
pub type VisitWeightsMutFn<'a> = dyn FnMut(&str, WeightRole, &mut Tensor) -> Result<()> + 'a;

/// Distinguishes trainable parameters from constant buffers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WeightRole {
    Parameter,
    Buffer,
}

/// Flat descriptor for one weight, as handed to external loaders.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightSpec {
    pub name: String,
    pub dims: Vec<usize>,
    pub dtype: DType,
    pub role: WeightRole,
}

#[derive(Default)]
struct WeightPath {
    segments: Vec<String>,
}

impl WeightPath {
    fn push(&mut self, segment: &str) -> Result<()> {
        check_segment(segment)?;
        self.segments.push(segment.to_string());
        Ok(())
    }

    fn pop(&mut self) {
        let _ = self.segments.pop();
    }

    fn join(&self, scratch: &mut String, leaf: &str) {
        scratch.clear();
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                scratch.push('.');
            }
            scratch.push_str(seg);
        }
        if !self.segments.is_empty() {
            scratch.push('.');
        }
        scratch.push_str(leaf);
    }
}

fn check_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::Internal {
            message: "weight path segments must be non-empty".to_string(),
        });
    }
    if segment.contains('.') {
        return Err(Error::Internal {
            message: format!("weight path segments must not contain '.', got '{segment}'"),
        });
    }
    if !segment.is_ascii() {
        return Err(Error::Internal {
            message: format!("weight path segments must be ASCII, got '{segment}'"),
        });
    }
    Ok(())
}

/// Read-only traversal over a layer's weights.
pub struct WeightVisitor<'a> {
    path: WeightPath,
    scratch: String,
    f: &'a mut VisitWeightsFn<'a>,
}

impl<'a> WeightVisitor<'a> {
    pub fn new(f: &'a mut VisitWeightsFn<'a>) -> Self {
        Self {
            path: WeightPath::default(),
            scratch: String::new(),
            f,
        }
    }

    pub fn scoped(
        &mut self,
        segment: &str,
        inner: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.path.push(segment)?;
        let out = inner(self);
        self.path.pop();
        out
    }

    pub fn weight(&mut self, leaf: &str, role: WeightRole, tensor: &Tensor) -> Result<()> {
        check_segment(leaf)?;
        self.path.join(&mut self.scratch, leaf);
        (self.f)(self.scratch.as_str(), role, tensor)
    }
}

/// Mutating traversal over a layer's weights, used for assignment.
pub struct WeightVisitorMut<'a> {
    path: WeightPath,
    scratch: String,
    f: &'a mut VisitWeightsMutFn<'a>,
}

impl<'a> WeightVisitorMut<'a> {
    pub fn new(f: &'a mut VisitWeightsMutFn<'a>) -> Self {
        Self {
            path: WeightPath::default(),
            scratch: String::new(),
            f,
        }
    }

    pub fn scoped(
        &mut self,
        segment: &str,
        inner: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.path.push(segment)?;
        let out = inner(self);
        self.path.pop();
        out
    }

    pub fn weight(&mut self, leaf: &str, role: WeightRole, tensor: &mut Tensor) -> Result<()> {
        check_segment(leaf)?;
        self.path.join(&mut self.scratch, leaf);
        (self.f)(self.scratch.as_str(), role, tensor)
    }
}

/// Validates a replacement tensor against the weight it overwrites.
pub fn check_assignment(name: &str, current: &Tensor, incoming: &Tensor) -> Result<()> {
    if incoming.dims() != current.dims() {
        return Err(Error::WeightShapeMismatch {
            name: name.to_string(),
            expected: current.dims().to_vec(),
            actual: incoming.dims().to_vec(),
        });
    }
    if incoming.dtype() != current.dtype() {
        return Err(Error::WeightDtypeMismatch {
            name: name.to_string(),
            expected: current.dtype(),
            actual: incoming.dtype(),
        });
    }
    Ok(())
}

impl WeightSpec {
    /// Element count of the described weight.
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Builds a spec from a visited weight.
    pub fn of(name: &str, role: WeightRole, tensor: &Tensor) -> Self {
        WeightSpec {
            name: name.to_string(),
            dims: tensor.dims().to_vec(),
            dtype: tensor.dtype(),
            role,
        }
    }
}
