use crate::error::RuntimeError;
use crate::graph::Node;
use crate::memory::{AllocatorPtr, Buffer};
use crate::tensor::{ElementType, TensorValue};

use std::sync::Arc;

/// Source of output buffers for a kernel invocation.
pub trait OutputAllocator: Send + Sync {
    fn allocate_output(
        &self,
        node: &Node,
        output_index: usize,
        dtype: ElementType,
        shape: &[usize],
    ) -> Result<TensorValue, RuntimeError>;
}

/// Allocates every output straight from one allocator. Handy for running a kernel outside a
/// session.
impl OutputAllocator for AllocatorPtr {
    fn allocate_output(
        &self,
        _node: &Node,
        _output_index: usize,
        dtype: ElementType,
        shape: &[usize],
    ) -> Result<TensorValue, RuntimeError> {
        TensorValue::allocate(self, dtype, shape.to_vec())
    }
}

/// Per-invocation view a kernel computes against.
pub struct KernelContext<'a> {
    node: &'a Node,
    inputs: Vec<Option<TensorValue>>,
    outputs: Vec<Option<TensorValue>>,
    aliased: Vec<bool>,
    allocator: &'a dyn OutputAllocator,
}

impl<'a> KernelContext<'a> {
    pub fn new(
        node: &'a Node,
        inputs: Vec<Option<TensorValue>>,
        allocator: &'a dyn OutputAllocator,
    ) -> Self {
        Self {
            node,
            inputs,
            outputs: vec![None; node.outputs.len()],
            aliased: vec![false; node.outputs.len()],
            allocator,
        }
    }

    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Required input `index`.
    pub fn input(&self, index: usize) -> Result<&TensorValue, RuntimeError> {
        self.optional_input(index).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "node '{}' ({}) is missing required input {}",
                self.node.name, self.node.op_type, index
            ))
        })
    }

    pub fn optional_input(&self, index: usize) -> Option<&TensorValue> {
        self.inputs.get(index)?.as_ref()
    }

    /// Output `index`, allocated on first request with the given type and shape.
    pub fn output(
        &mut self,
        index: usize,
        dtype: ElementType,
        shape: &[usize],
    ) -> Result<&mut TensorValue, RuntimeError> {
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "node '{}' has no output {}",
                self.node.name, index
            ))
        })?;
        if let Some(existing) = slot.as_ref() {
            if existing.dtype() != dtype || existing.shape() != shape {
                return Err(RuntimeError::ShapeMismatch {
                    expected: existing.shape().to_vec(),
                    actual: shape.to_vec(),
                });
            }
        } else {
            let value = self
                .allocator
                .allocate_output(self.node, index, dtype, shape)?;
            *slot = Some(value);
        }
        slot.as_mut().ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("output {} was not allocated", index))
        })
    }

    /// Bind output `index` to an existing buffer without copying.
    pub fn alias_output(
        &mut self,
        index: usize,
        dtype: ElementType,
        shape: &[usize],
        buffer: Arc<Buffer>,
    ) -> Result<(), RuntimeError> {
        let value = TensorValue::new(dtype, shape.to_vec(), buffer)?;
        match self.outputs.get_mut(index) {
            Some(slot) => {
                *slot = Some(value);
                self.aliased[index] = true;
                Ok(())
            }
            None => Err(RuntimeError::InvalidArgument(format!(
                "node '{}' has no output {}",
                self.node.name, index
            ))),
        }
    }

    /// Which outputs were bound with [`alias_output`](Self::alias_output).
    pub fn aliased_outputs(&self) -> &[bool] {
        &self.aliased
    }

    pub fn into_outputs(self) -> Vec<Option<TensorValue>> {
        self.outputs
    }
}
