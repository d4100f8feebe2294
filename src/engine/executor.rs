//! Sequential and parallel graph executors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::error::RuntimeError;
use crate::graph::{Node, NodeIndex};
use crate::kernel::{KernelContext, OutputAllocator};
use crate::tensor::{ElementType, TensorValue, Value};

use super::frame::{BufferSource, ExecutionFrame, PatternMode};
use super::options::RunOptions;
use super::pattern::PatternPlanner;
use super::plan::{AllocationPlan, NodePlan, ValueIndex};
use super::state::{PatternKey, SessionState};

/// Runs every node of a session graph once.
pub trait Executor: Send + Sync {
    /// Execute with bound `feeds` and return the values at `fetches`, in order.
    fn execute(
        &self,
        state: &SessionState,
        run_options: &RunOptions,
        feeds: Vec<(ValueIndex, Value)>,
        fetches: &[ValueIndex],
    ) -> Result<Vec<Value>, RuntimeError>;
}

fn lock<'a, 's>(frame: &'a Mutex<ExecutionFrame<'s>>) -> MutexGuard<'a, ExecutionFrame<'s>> {
    frame.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands kernel output requests to the frame's planned allocation.
struct FrameOutputs<'a, 's> {
    frame: &'a Mutex<ExecutionFrame<'s>>,
    plan: &'a NodePlan,
}

impl OutputAllocator for FrameOutputs<'_, '_> {
    fn allocate_output(
        &self,
        node: &Node,
        output_index: usize,
        dtype: ElementType,
        shape: &[usize],
    ) -> Result<TensorValue, RuntimeError> {
        let index = self
            .plan
            .outputs
            .get(output_index)
            .copied()
            .flatten()
            .ok_or_else(|| {
                RuntimeError::InvalidArgument(format!(
                    "node '{}' has no output {}",
                    node.name, output_index
                ))
            })?;
        lock(self.frame).allocate_planned(index, dtype, shape)
    }
}

/// Gather inputs, compute, bind outputs, release what died. The frame lock is not held
/// while the kernel runs.
fn run_node(
    state: &SessionState,
    plan: &AllocationPlan,
    frame: &Mutex<ExecutionFrame<'_>>,
    index: NodeIndex,
) -> Result<(), RuntimeError> {
    let node = state
        .graph()
        .node(index)
        .ok_or_else(|| RuntimeError::Graph(format!("node {} vanished", index)))?;
    let node_plan = plan
        .node_plan(index)
        .ok_or_else(|| RuntimeError::Graph(format!("node '{}' is not planned", node.name)))?;
    let kernel = state.kernel(index)?;

    let inputs = lock(frame).inputs_for(node_plan)?;
    let allocator = FrameOutputs {
        frame,
        plan: node_plan,
    };
    let mut ctx = KernelContext::new(node, inputs, &allocator);
    let started = Instant::now();
    kernel
        .compute(&mut ctx)
        .map_err(|e| RuntimeError::execution(&node.name, &node.op_type, e))?;
    let aliased = ctx.aliased_outputs().to_vec();
    let outputs = ctx.into_outputs();
    trace!(
        node = %node.name,
        op = %node.op_type,
        elapsed_us = started.elapsed().as_micros() as u64,
        "Node done"
    );

    let mut frame = lock(frame);
    for ((slot, value), in_place) in node_plan.outputs.iter().zip(outputs).zip(aliased) {
        let (Some(index), Some(value)) = (slot, value) else {
            continue;
        };
        if in_place {
            let location = value.location().clone();
            let source = BufferSource::Preallocated(Arc::clone(value.buffer()));
            frame.allocate_value(*index, value.dtype(), &location, value.shape(), source)?;
        } else {
            frame.set_value(*index, value)?;
        }
    }
    frame.finish_node(node_plan)
}

/// Runs nodes one at a time in topological order. Uses the reuse plan and memory patterns.
#[derive(Debug, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    fn pattern_key(feeds: &[(ValueIndex, Value)]) -> PatternKey {
        let mut key: PatternKey = feeds
            .iter()
            .map(|(index, value)| {
                let shape = value.as_tensor().map(|t| t.shape().to_vec()).unwrap_or_default();
                (*index, shape)
            })
            .collect();
        key.sort();
        key
    }
}

impl Executor for SequentialExecutor {
    fn execute(
        &self,
        state: &SessionState,
        run_options: &RunOptions,
        feeds: Vec<(ValueIndex, Value)>,
        fetches: &[ValueIndex],
    ) -> Result<Vec<Value>, RuntimeError> {
        let plan = state.plan(true);
        let key = Self::pattern_key(&feeds);
        let mode = if state.mem_pattern_enabled() {
            match state.cached_pattern(&key) {
                Some(pattern) => PatternMode::Replay(pattern),
                None => PatternMode::Record(PatternPlanner::new()),
            }
        } else {
            PatternMode::Off
        };
        debug!(tag = %run_options.tag, nodes = plan.execution_order.len(), "Sequential execution");

        let frame = Mutex::new(ExecutionFrame::new(state, plan, feeds, fetches, mode)?);
        for &index in &plan.execution_order {
            run_node(state, plan, &frame, index)?;
        }

        let mut frame = frame.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(pattern) = frame.generate_pattern() {
            state.store_pattern(key, pattern);
        }
        frame.fetch_outputs()
    }
}

/// Runs each node as soon as all of its producers are done, on the current rayon pool.
/// Never reuses buffers. After the first failure no new nodes are started.
#[derive(Debug, Default)]
pub struct ParallelExecutor;

struct Shared<'a, 's> {
    state: &'s SessionState,
    plan: &'s AllocationPlan,
    frame: &'a Mutex<ExecutionFrame<'s>>,
    pending: HashMap<NodeIndex, AtomicUsize>,
    failed: AtomicBool,
    first_error: Mutex<Option<RuntimeError>>,
}

impl Shared<'_, '_> {
    fn record_error(&self, error: RuntimeError) {
        self.failed.store(true, Ordering::SeqCst);
        let mut slot = self
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        } else {
            warn!(error = %error, "Further node failure after the first");
        }
    }
}

fn spawn_node<'scope, 'a: 'scope, 's: 'scope>(
    scope: &rayon::Scope<'scope>,
    shared: &'scope Shared<'a, 's>,
    index: NodeIndex,
) {
    scope.spawn(move |scope| {
        if shared.failed.load(Ordering::SeqCst) {
            return;
        }
        match run_node(shared.state, shared.plan, shared.frame, index) {
            Ok(()) => {
                let deps = shared.state.dependencies();
                for &next in deps.downstream.get(&index).into_iter().flatten() {
                    let ready = shared
                        .pending
                        .get(&next)
                        .map_or(false, |p| p.fetch_sub(1, Ordering::AcqRel) == 1);
                    if ready {
                        spawn_node(scope, shared, next);
                    }
                }
            }
            Err(e) => shared.record_error(e),
        }
    });
}

impl Executor for ParallelExecutor {
    fn execute(
        &self,
        state: &SessionState,
        run_options: &RunOptions,
        feeds: Vec<(ValueIndex, Value)>,
        fetches: &[ValueIndex],
    ) -> Result<Vec<Value>, RuntimeError> {
        let plan = state.plan(false);
        let deps = state.dependencies();
        debug!(
            tag = %run_options.tag,
            nodes = plan.execution_order.len(),
            threads = rayon::current_num_threads(),
            "Parallel execution"
        );

        let frame = Mutex::new(ExecutionFrame::new(
            state,
            plan,
            feeds,
            fetches,
            PatternMode::Off,
        )?);
        let shared = Shared {
            state,
            plan,
            frame: &frame,
            pending: deps
                .upstream_count
                .iter()
                .map(|(&node, &count)| (node, AtomicUsize::new(count)))
                .collect(),
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
        };
        let roots = deps.roots();
        rayon::scope(|scope| {
            for &root in &roots {
                spawn_node(scope, &shared, root);
            }
        });

        if let Some(error) = shared
            .first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(error);
        }
        let mut frame = frame.into_inner().unwrap_or_else(PoisonError::into_inner);
        frame.fetch_outputs()
    }
}
