//! Per-run value table.
//!
//! The frame owns every intermediate value of one run. It binds feeds and initializers
//! up front, hands out output buffers to kernels according to the allocation plan (fresh
//! arena buffers, buffers of values that died earlier, or slices of a memory-pattern
//! block), and releases values once their last reader has finished. A frame is
//! single-writer; the parallel executor wraps it in a mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::RuntimeError;
use crate::memory::{AllocatorInfo, Buffer};
use crate::tensor::{byte_size, ElementType, TensorValue, Value};

use super::pattern::{MemoryPattern, PatternPlanner};
use super::plan::{AllocKind, AllocationPlan, NodePlan, ValueIndex};
use super::state::SessionState;

/// Where the buffer of a value bound through [`ExecutionFrame::allocate_value`] comes from.
#[derive(Debug, Clone)]
pub enum BufferSource {
    /// A new buffer from the location's allocator, owned by the value.
    SelfOwned,
    /// An existing buffer, bound without copying. In-place kernel outputs arrive this way.
    Preallocated(Arc<Buffer>),
}

/// Memory-pattern behaviour for one run.
pub enum PatternMode {
    Off,
    Record(PatternPlanner),
    Replay(Arc<MemoryPattern>),
}

pub struct ExecutionFrame<'s> {
    state: &'s SessionState,
    plan: &'s AllocationPlan,
    values: Vec<Value>,
    remaining: Vec<usize>,
    released: Vec<bool>,
    /// Buffers of dead values waiting for the value planned to reuse them.
    retained: HashMap<ValueIndex, Arc<Buffer>>,
    /// Value whose traced allocation backs each buffer, while recording.
    trace_root: Vec<Option<ValueIndex>>,
    /// Live values per traced allocation. The block is freed in the pattern at zero.
    root_holders: HashMap<ValueIndex, usize>,
    /// Traced allocations by buffer address, to recognise aliases.
    root_by_buffer: HashMap<usize, ValueIndex>,
    output_indices: Vec<ValueIndex>,
    pattern: PatternMode,
    blocks: BTreeMap<AllocatorInfo, Arc<Buffer>>,
}

impl<'s> ExecutionFrame<'s> {
    /// Create a frame for one run and bind feeds and initializers.
    pub fn new(
        state: &'s SessionState,
        plan: &'s AllocationPlan,
        feeds: Vec<(ValueIndex, Value)>,
        output_indices: &[ValueIndex],
        pattern: PatternMode,
    ) -> Result<Self, RuntimeError> {
        let n = plan.entries.len();
        let mut frame = Self {
            state,
            plan,
            values: vec![Value::Empty; n],
            remaining: plan.entries.iter().map(|e| e.use_count).collect(),
            released: vec![false; n],
            retained: HashMap::new(),
            trace_root: vec![None; n],
            root_holders: HashMap::new(),
            root_by_buffer: HashMap::new(),
            output_indices: output_indices.to_vec(),
            pattern,
            blocks: BTreeMap::new(),
        };

        for (index, value) in state.initializer_values() {
            frame.values[*index] = Value::Tensor(value.clone());
        }
        for (index, value) in feeds {
            frame.bind_feed(index, value)?;
        }
        for &index in state.input_indices() {
            let needed = plan.entries[index].use_count > 0;
            if needed && frame.values[index].is_empty() {
                return Err(RuntimeError::InvalidArgument(format!(
                    "missing feed for graph input '{}'",
                    state.value_name(index)
                )));
            }
        }

        if let PatternMode::Replay(pattern) = &frame.pattern {
            for (location, layout) in &pattern.locations {
                if layout.peak_size == 0 {
                    continue;
                }
                let allocator = state.allocator(location)?;
                let block = Buffer::allocate(allocator, layout.peak_size)?;
                frame.blocks.insert(location.clone(), Arc::new(block));
            }
            debug!(blocks = frame.blocks.len(), "Replaying memory pattern");
        }
        Ok(frame)
    }

    fn bind_feed(&mut self, index: ValueIndex, value: Value) -> Result<(), RuntimeError> {
        let name = self.state.value_name(index).to_string();
        let entry = self.plan.entry(index).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("feed index {} out of range", index))
        })?;
        if entry.kind != AllocKind::External {
            return Err(RuntimeError::InvalidArgument(format!(
                "'{}' is not a graph input",
                name
            )));
        }
        let Value::Tensor(tensor) = value else {
            return Err(RuntimeError::InvalidArgument(format!(
                "feed '{}' is empty",
                name
            )));
        };
        if tensor.location() != &entry.location {
            return Err(RuntimeError::InvalidArgument(format!(
                "feed '{}' is in {} memory, expected {}",
                name,
                tensor.location(),
                entry.location
            )));
        }
        self.values[index] = Value::Tensor(tensor);
        Ok(())
    }

    fn check_index(&self, index: ValueIndex) -> Result<(), RuntimeError> {
        if index >= self.values.len() {
            return Err(RuntimeError::InvalidArgument(format!(
                "value index {} out of range ({} values)",
                index,
                self.values.len()
            )));
        }
        Ok(())
    }

    fn is_output(&self, index: ValueIndex) -> bool {
        self.output_indices.contains(&index) || self.plan.is_graph_output(index)
    }

    /// Allocate and bind a tensor value at `index`.
    ///
    /// A preallocated buffer must live at `location`. When it belongs to a value traced for
    /// the memory pattern, `index` keeps that allocation alive until it is released too.
    pub fn allocate_value(
        &mut self,
        index: ValueIndex,
        dtype: ElementType,
        location: &AllocatorInfo,
        shape: &[usize],
        source: BufferSource,
    ) -> Result<(), RuntimeError> {
        self.check_index(index)?;
        let value = match source {
            BufferSource::SelfOwned => {
                let allocator = self.state.allocator(location)?;
                TensorValue::allocate(allocator, dtype, shape.to_vec())?
            }
            BufferSource::Preallocated(buffer) => {
                if buffer.location() != location {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "buffer for '{}' is in {} memory, expected {}",
                        self.state.value_name(index),
                        buffer.location(),
                        location
                    )));
                }
                self.skip_planned_reuse(index);
                TensorValue::new(dtype, shape.to_vec(), buffer)?
            }
        };
        self.set_value(index, value)
    }

    /// Give up the buffer retained for `index` when it is bound some other way.
    fn skip_planned_reuse(&mut self, index: ValueIndex) {
        let plan = self.plan;
        if let AllocKind::Reuse(source) = plan.entries[index].kind {
            if self.retained.remove(&source).is_some() {
                trace!(value = index, source, "Planned reuse skipped");
                self.trace_free(source);
            }
        }
    }

    /// Allocate the buffer for value `index` as the plan dictates, without binding it.
    pub fn allocate_planned(
        &mut self,
        index: ValueIndex,
        dtype: ElementType,
        shape: &[usize],
    ) -> Result<TensorValue, RuntimeError> {
        self.check_index(index)?;
        let plan = self.plan;
        let entry = &plan.entries[index];
        let location = entry.location.clone();
        let size = byte_size(dtype, shape)?;
        let is_output = self.is_output(index);

        if let (AllocKind::Reuse(source), false) = (entry.kind, is_output) {
            if let Some(buffer) = self.retained.remove(&source) {
                if size > 0 && buffer.len() >= size && Arc::strong_count(&buffer) == 1 {
                    trace!(value = index, source, size, "Reusing buffer");
                    self.trace_root[index] = self.trace_root[source].take();
                    return TensorValue::new(dtype, shape.to_vec(), buffer);
                }
                debug!(value = index, source, size, have = buffer.len(), "Planned reuse not possible");
                drop(buffer);
                self.trace_free(source);
            }
        }

        if let (PatternMode::Replay(pattern), false) = (&self.pattern, is_output) {
            if let (Some(block), Some(base)) =
                (pattern.block(&location, index), self.blocks.get(&location))
            {
                if size > 0 && block.size >= size {
                    let buffer = Buffer::slice_of(base, block.offset, size)?;
                    return TensorValue::new(dtype, shape.to_vec(), Arc::new(buffer));
                }
            }
        }

        let allocator = self.state.allocator(&location)?;
        let value = TensorValue::allocate(allocator, dtype, shape.to_vec())?;
        if is_output || size == 0 || !matches!(self.pattern, PatternMode::Record(_)) {
            return Ok(value);
        }
        self.trace_free(index);
        if let PatternMode::Record(planner) = &mut self.pattern {
            planner.trace_allocation(&location, index, size);
        }
        self.trace_root[index] = Some(index);
        self.root_holders.insert(index, 1);
        self.root_by_buffer.insert(buffer_key(value.buffer()), index);
        Ok(value)
    }

    /// Drop the hold `index` has on its traced allocation. The allocation is freed in the
    /// pattern once no live value holds its buffer.
    fn trace_free(&mut self, index: ValueIndex) {
        let Some(root) = self.trace_root[index].take() else {
            return;
        };
        let holders = self.root_holders.entry(root).or_insert(1);
        *holders = holders.saturating_sub(1);
        if *holders > 0 {
            return;
        }
        self.root_holders.remove(&root);
        self.root_by_buffer.retain(|_, r| *r != root);
        if let PatternMode::Record(planner) = &mut self.pattern {
            planner.trace_free(&self.plan.entries[root].location, root);
        }
    }

    /// Point `index` at the traced allocation behind its buffer, if any.
    fn track_buffer(&mut self, index: ValueIndex, value: &TensorValue) {
        if !matches!(self.pattern, PatternMode::Record(_)) {
            return;
        }
        let root = self.root_by_buffer.get(&buffer_key(value.buffer())).copied();
        if root == self.trace_root[index] {
            return;
        }
        self.trace_free(index);
        if let Some(root) = root {
            *self.root_holders.entry(root).or_insert(0) += 1;
            self.trace_root[index] = Some(root);
            trace!(value = index, root, "Value shares a traced buffer");
        }
    }

    /// Bind a kernel-produced value at `index`.
    pub fn set_value(&mut self, index: ValueIndex, value: TensorValue) -> Result<(), RuntimeError> {
        self.check_index(index)?;
        self.track_buffer(index, &value);
        self.values[index] = Value::Tensor(value);
        self.released[index] = false;
        Ok(())
    }

    pub fn get_value(&self, index: ValueIndex) -> Result<&Value, RuntimeError> {
        self.check_index(index)?;
        match &self.values[index] {
            Value::Empty => Err(RuntimeError::InvalidArgument(format!(
                "value '{}' is not bound",
                self.state.value_name(index)
            ))),
            value => Ok(value),
        }
    }

    pub fn get_mutable_value(&mut self, index: ValueIndex) -> Result<&mut Value, RuntimeError> {
        self.get_value(index)?;
        Ok(&mut self.values[index])
    }

    /// Drop one use of `index`. At zero the value is freed, or its buffer is kept for the
    /// value planned to reuse it. Run outputs and graph outputs are never freed.
    pub fn release_value(&mut self, index: ValueIndex) -> Result<(), RuntimeError> {
        self.check_index(index)?;
        if self.released[index] {
            return Ok(());
        }
        self.remaining[index] = self.remaining[index].saturating_sub(1);
        if self.remaining[index] > 0 || self.is_output(index) {
            return Ok(());
        }
        self.released[index] = true;
        let value = std::mem::take(&mut self.values[index]);
        let plan = self.plan;
        let entry = &plan.entries[index];
        match entry.kind {
            AllocKind::Allocate | AllocKind::Reuse(_) => {
                if let (true, Value::Tensor(tensor)) = (entry.reused_later, &value) {
                    self.retained.insert(index, Arc::clone(tensor.buffer()));
                    trace!(value = index, "Retained buffer for reuse");
                } else {
                    drop(value);
                    self.trace_free(index);
                }
            }
            AllocKind::External | AllocKind::Initializer => {}
        }
        Ok(())
    }

    /// Tensor handles for a node's inputs.
    pub fn inputs_for(&self, plan: &NodePlan) -> Result<Vec<Option<TensorValue>>, RuntimeError> {
        plan.inputs
            .iter()
            .map(|slot| match slot {
                Some(index) => match self.get_value(*index)? {
                    Value::Tensor(t) => Ok(Some(t.clone())),
                    Value::Empty => Ok(None),
                },
                None => Ok(None),
            })
            .collect()
    }

    /// Release a node's inputs, and outputs nobody reads.
    pub fn finish_node(&mut self, plan: &NodePlan) -> Result<(), RuntimeError> {
        for &index in plan.inputs.iter().flatten() {
            self.release_value(index)?;
        }
        for &index in plan.outputs.iter().flatten() {
            if self.plan.entries[index].use_count == 0 {
                self.release_value(index)?;
            }
        }
        Ok(())
    }

    /// The memory pattern observed so far, when recording.
    pub fn generate_pattern(&self) -> Option<MemoryPattern> {
        match &self.pattern {
            PatternMode::Record(planner) => Some(planner.generate()),
            _ => None,
        }
    }

    /// Move the requested outputs out of the frame.
    pub fn fetch_outputs(&mut self) -> Result<Vec<Value>, RuntimeError> {
        let indices = self.output_indices.clone();
        indices
            .into_iter()
            .map(|index| {
                let value = self.get_value(index)?.clone();
                Ok(value)
            })
            .collect()
    }

    /// Buffers currently kept for planned reuse.
    pub fn num_retained(&self) -> usize {
        self.retained.len()
    }
}

fn buffer_key(buffer: &Arc<Buffer>) -> usize {
    Arc::as_ptr(buffer) as usize
}
