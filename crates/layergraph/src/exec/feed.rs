//! Call-scoped mapping from symbolic values to concrete tensors.

use log::debug;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::graph::{GraphTensor, ValueId};
use crate::tensor::Tensor;

/// Concrete tensors keyed by symbolic value identity, plus a name index for
/// lookups by string.
///
/// Cloning a feed copies only the associations; tensor storage is shared.
#[derive(Clone, Default)]
pub struct FeedMap {
    entries: HashMap<ValueId, Tensor>,
    names: Vec<(String, ValueId)>,
}

impl FeedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a tensor for `key`, validating shape and dtype.
    ///
    /// Re-feeding an already-present value is rejected rather than
    /// overwritten. Rank or static-axis disagreement is rejected; a dtype
    /// difference is resolved by the safe widening cast when one exists.
    pub fn insert(&mut self, key: &GraphTensor, value: Tensor) -> Result<()> {
        if self.entries.contains_key(&key.id()) {
            return Err(Error::DuplicateFeed {
                value: key.name().to_string(),
            });
        }
        let spec = key.spec();
        if !spec.shape.accepts(value.dims()) {
            return Err(Error::FeedShapeMismatch {
                value: key.name().to_string(),
                expected: spec.shape.clone(),
                actual: value.dims().to_vec(),
            });
        }
        let value = if value.dtype() == spec.dtype {
            value
        } else {
            if !value.dtype().casts_to(spec.dtype) {
                return Err(Error::FeedDtypeMismatch {
                    value: key.name().to_string(),
                    expected: spec.dtype,
                    actual: value.dtype(),
                });
            }
            debug!(
                "casting feed '{}' from {} to {}",
                key.name(),
                value.dtype(),
                spec.dtype
            );
            value.cast(spec.dtype).map_err(|err| Error::Internal {
                message: format!("feed cast for '{}' failed: {err}", key.name()),
            })?
        };
        self.names.push((key.name().to_string(), key.id()));
        self.entries.insert(key.id(), value);
        Ok(())
    }

    /// Fetches the tensor stored for `key`.
    pub fn get(&self, key: &GraphTensor) -> Result<&Tensor> {
        self.entries.get(&key.id()).ok_or_else(|| Error::MissingKey {
            value: key.name().to_string(),
        })
    }

    pub fn contains(&self, key: &GraphTensor) -> bool {
        self.entries.contains_key(&key.id())
    }

    /// Linear scan for a fed value by name; feeds stay small, bounded by
    /// the model's input count.
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|(entry, _)| entry == name)
    }

    /// Linear scan returning the tensor fed under `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Tensor> {
        let (_, id) = self.names.iter().find(|(entry, _)| entry == name)?;
        self.entries.get(id)
    }

    pub(crate) fn contains_id(&self, id: ValueId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.entries.keys().copied()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (ValueId, &Tensor)> + '_ {
        self.entries.iter().map(|(&id, tensor)| (id, tensor))
    }
}
