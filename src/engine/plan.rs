//! Allocation planning.
//!
//! Every value (graph edge) gets an index and a plan entry deciding where its buffer
//! comes from: a fresh allocation, the buffer of a value that died earlier, a caller
//! feed, or a placed initializer. Buffer reuse is only planned for sequential execution;
//! the parallel plan never aliases buffers.

use std::collections::HashMap;

use tracing::debug;

use crate::error::RuntimeError;
use crate::graph::{Graph, NodeIndex};
use crate::kernel::KernelRegistry;
use crate::memory::AllocatorInfo;

pub type ValueIndex = usize;

/// Bidirectional value name ↔ index table.
#[derive(Debug, Clone, Default)]
pub struct ValueIndexMap {
    names: Vec<String>,
    indices: HashMap<String, ValueIndex>,
}

impl ValueIndexMap {
    /// Index graph inputs, initializers, then node args in `order`.
    pub fn build(graph: &Graph, order: &[NodeIndex]) -> Self {
        let mut map = Self::default();
        for name in graph.inputs() {
            map.insert(name);
        }
        for name in graph.initializers().keys() {
            map.insert(name);
        }
        for node in order.iter().filter_map(|&i| graph.node(i)) {
            for arg in node.existing_inputs().chain(node.existing_outputs()) {
                map.insert(arg);
            }
        }
        for name in graph.outputs() {
            map.insert(name);
        }
        map
    }

    fn insert(&mut self, name: &str) -> ValueIndex {
        if let Some(&i) = self.indices.get(name) {
            return i;
        }
        let i = self.names.len();
        self.names.push(name.to_string());
        self.indices.insert(name.to_string(), i);
        i
    }

    pub fn index(&self, name: &str) -> Option<ValueIndex> {
        self.indices.get(name).copied()
    }

    pub fn name(&self, index: ValueIndex) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Where a value's buffer comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Fresh buffer from the location's allocator (or a memory pattern block).
    Allocate,
    /// Take over the buffer of a value whose lifetime already ended.
    Reuse(ValueIndex),
    /// Supplied by the caller as a feed.
    External,
    /// Placed constant owned by the session.
    Initializer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocPlanEntry {
    pub kind: AllocKind,
    pub location: AllocatorInfo,
    /// Number of reads by nodes, plus one if the value is a graph output.
    pub use_count: usize,
    /// A later value takes over this value's buffer.
    pub reused_later: bool,
    pub static_size: Option<usize>,
}

/// Value indices read and written by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    pub node: NodeIndex,
    /// `None` for a missing optional input.
    pub inputs: Vec<Option<ValueIndex>>,
    pub outputs: Vec<Option<ValueIndex>>,
}

#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub entries: Vec<AllocPlanEntry>,
    pub execution_order: Vec<NodeIndex>,
    pub node_plans: HashMap<NodeIndex, NodePlan>,
    pub graph_outputs: Vec<ValueIndex>,
    pub allows_reuse: bool,
}

impl AllocationPlan {
    pub fn entry(&self, index: ValueIndex) -> Option<&AllocPlanEntry> {
        self.entries.get(index)
    }

    pub fn node_plan(&self, node: NodeIndex) -> Option<&NodePlan> {
        self.node_plans.get(&node)
    }

    pub fn is_graph_output(&self, index: ValueIndex) -> bool {
        self.graph_outputs.contains(&index)
    }

    pub fn num_reused(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, AllocKind::Reuse(_)))
            .count()
    }
}

/// Inputs the planner needs besides the graph.
pub struct PlannerContext<'a> {
    pub graph: &'a Graph,
    pub values: &'a ValueIndexMap,
    pub execution_order: &'a [NodeIndex],
    pub kernels: &'a KernelRegistry,
    /// Memory location of each backend by name.
    pub locations: &'a HashMap<String, AllocatorInfo>,
}

impl PlannerContext<'_> {
    fn backend_location(&self, backend: &str) -> Result<AllocatorInfo, RuntimeError> {
        self.locations.get(backend).cloned().ok_or_else(|| {
            RuntimeError::Backend(format!("no memory location for backend '{}'", backend))
        })
    }

    fn output_location(
        &self,
        backend: &str,
        op_type: &str,
        index: usize,
    ) -> Result<AllocatorInfo, RuntimeError> {
        let pinned = self
            .kernels
            .lookup(backend, op_type)
            .map_or(false, |k| k.def.is_output_on_host(index));
        if pinned {
            Ok(AllocatorInfo::cpu())
        } else {
            self.backend_location(backend)
        }
    }

    fn input_location(
        &self,
        backend: &str,
        op_type: &str,
        index: usize,
    ) -> Result<AllocatorInfo, RuntimeError> {
        let pinned = self
            .kernels
            .lookup(backend, op_type)
            .map_or(false, |k| k.def.is_input_on_host(index));
        if pinned {
            Ok(AllocatorInfo::cpu())
        } else {
            self.backend_location(backend)
        }
    }

    fn lookup(&self, name: &str) -> Result<ValueIndex, RuntimeError> {
        self.values
            .index(name)
            .ok_or_else(|| RuntimeError::Graph(format!("value '{}' is not indexed", name)))
    }
}

/// Build the allocation plan. Reuse is planned only when `allow_reuse` is set.
pub fn create_plan(
    ctx: &PlannerContext<'_>,
    allow_reuse: bool,
) -> Result<AllocationPlan, RuntimeError> {
    let graph = ctx.graph;
    let mut entries: Vec<AllocPlanEntry> = (0..ctx.values.len())
        .map(|i| AllocPlanEntry {
            kind: AllocKind::Allocate,
            location: AllocatorInfo::cpu(),
            use_count: 0,
            reused_later: false,
            static_size: ctx
                .values
                .name(i)
                .and_then(|n| graph.node_arg(n))
                .and_then(|a| a.static_byte_size()),
        })
        .collect();

    for name in graph.inputs() {
        entries[ctx.lookup(name)?].kind = AllocKind::External;
    }
    for name in graph.initializers().keys() {
        let entry = &mut entries[ctx.lookup(name)?];
        entry.kind = AllocKind::Initializer;
    }

    // Per-node value lists, output locations, and use counts.
    let mut node_plans = HashMap::new();
    let mut initializer_location: HashMap<ValueIndex, AllocatorInfo> = HashMap::new();
    for &index in ctx.execution_order {
        let node = graph
            .node(index)
            .ok_or_else(|| RuntimeError::Graph(format!("node {} vanished", index)))?;
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for (i, name) in node.inputs.iter().enumerate() {
            if name.is_empty() {
                inputs.push(None);
                continue;
            }
            let v = ctx.lookup(name)?;
            entries[v].use_count += 1;
            if entries[v].kind == AllocKind::Initializer && !initializer_location.contains_key(&v) {
                let location = ctx.input_location(&node.backend, &node.op_type, i)?;
                initializer_location.insert(v, location);
            }
            inputs.push(Some(v));
        }
        let mut outputs = Vec::with_capacity(node.outputs.len());
        for (i, name) in node.outputs.iter().enumerate() {
            if name.is_empty() {
                outputs.push(None);
                continue;
            }
            let v = ctx.lookup(name)?;
            entries[v].location = ctx.output_location(&node.backend, &node.op_type, i)?;
            outputs.push(Some(v));
        }
        node_plans.insert(
            index,
            NodePlan {
                node: index,
                inputs,
                outputs,
            },
        );
    }
    for (v, location) in initializer_location {
        entries[v].location = location;
    }

    let mut graph_outputs = Vec::new();
    for name in graph.outputs() {
        let v = ctx.lookup(name)?;
        entries[v].use_count += 1;
        graph_outputs.push(v);
    }

    if allow_reuse {
        plan_reuse(&mut entries, ctx.execution_order, &node_plans, &graph_outputs);
    }

    let plan = AllocationPlan {
        entries,
        execution_order: ctx.execution_order.to_vec(),
        node_plans,
        graph_outputs,
        allows_reuse: allow_reuse,
    };
    debug!(
        values = plan.entries.len(),
        reused = plan.num_reused(),
        allow_reuse,
        "Created allocation plan"
    );
    Ok(plan)
}

/// Pair each freshly allocated value with a dead value of equal size and location.
fn plan_reuse(
    entries: &mut [AllocPlanEntry],
    order: &[NodeIndex],
    node_plans: &HashMap<NodeIndex, NodePlan>,
    graph_outputs: &[ValueIndex],
) {
    let reusable = |e: &AllocPlanEntry| matches!(e.kind, AllocKind::Allocate | AllocKind::Reuse(_));
    let mut remaining: Vec<usize> = entries.iter().map(|e| e.use_count).collect();
    let mut dead: Vec<ValueIndex> = Vec::new();

    for index in order {
        let Some(plan) = node_plans.get(index) else {
            continue;
        };
        for &v in plan.outputs.iter().flatten() {
            if graph_outputs.contains(&v) || entries[v].kind != AllocKind::Allocate {
                continue;
            }
            let Some(size) = entries[v].static_size else {
                continue;
            };
            let found = dead.iter().position(|&d| {
                entries[d].static_size == Some(size) && entries[d].location == entries[v].location
            });
            if let Some(pos) = found {
                let source = dead.remove(pos);
                entries[v].kind = AllocKind::Reuse(source);
                entries[source].reused_later = true;
            }
        }

        // Values whose last read is this node, and outputs nobody reads, die here.
        let mut dying: Vec<ValueIndex> = Vec::new();
        for &v in plan.inputs.iter().flatten() {
            remaining[v] = remaining[v].saturating_sub(1);
            if remaining[v] == 0 && !dying.contains(&v) {
                dying.push(v);
            }
        }
        for &v in plan.outputs.iter().flatten() {
            if remaining[v] == 0 && !dying.contains(&v) {
                dying.push(v);
            }
        }
        for v in dying {
            if reusable(&entries[v]) && !graph_outputs.contains(&v) {
                dead.push(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, ExecutionBackend};
    use crate::graph::NodeArg;
    use crate::tensor::{ElementType, Tensor};

    fn place_all(g: &mut Graph, backend: &str) {
        for node in g.nodes_mut() {
            node.backend = backend.to_string();
        }
    }

    fn plan_for(g: &Graph, allow_reuse: bool) -> (AllocationPlan, ValueIndexMap) {
        let order = g.topological_order().unwrap();
        let values = ValueIndexMap::build(g, &order);
        let mut kernels = KernelRegistry::new();
        CpuBackend::new().register_kernels(&mut kernels);
        let locations = HashMap::from([("cpu".to_string(), AllocatorInfo::cpu())]);
        let ctx = PlannerContext {
            graph: g,
            values: &values,
            execution_order: &order,
            kernels: &kernels,
            locations: &locations,
        };
        (create_plan(&ctx, allow_reuse).unwrap(), values)
    }

    /// x -> a -> b -> c -> y, all [4] f32.
    fn typed_chain() -> Graph {
        let mut g = Graph::new("chain");
        g.add_input(NodeArg::typed("x", ElementType::F32, &[4]));
        g.add_node("n1", "Relu", &["x"], &["a"]);
        g.add_node("n2", "Relu", &["a"], &["b"]);
        g.add_node("n3", "Relu", &["b"], &["c"]);
        g.add_node("n4", "Relu", &["c"], &["y"]);
        for name in ["a", "b", "c", "y"] {
            g.set_node_arg(NodeArg::typed(name, ElementType::F32, &[4]));
        }
        g.add_output("y");
        place_all(&mut g, "cpu");
        g
    }

    #[test]
    fn test_value_indices() {
        let g = typed_chain();
        let (_, values) = plan_for(&g, false);
        assert_eq!(values.len(), 5);
        assert_eq!(values.index("x"), Some(0));
        assert_eq!(values.name(values.index("y").unwrap()), Some("y"));
    }

    #[test]
    fn test_use_counts_and_kinds() {
        let g = typed_chain();
        let (plan, values) = plan_for(&g, false);
        let x = values.index("x").unwrap();
        let y = values.index("y").unwrap();
        assert_eq!(plan.entries[x].kind, AllocKind::External);
        assert_eq!(plan.entries[x].use_count, 1);
        assert_eq!(plan.entries[y].use_count, 1);
        assert!(plan.is_graph_output(y));
        assert_eq!(plan.num_reused(), 0);
        assert_eq!(plan.execution_order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_reuse_only_dead_sources() {
        let g = typed_chain();
        let (plan, values) = plan_for(&g, true);
        let a = values.index("a").unwrap();
        let c = values.index("c").unwrap();
        let y = values.index("y").unwrap();
        // a dies at n2, so c (produced by n3) can take its buffer; b is still live then.
        assert_eq!(plan.entries[c].kind, AllocKind::Reuse(a));
        assert!(plan.entries[a].reused_later);
        assert_eq!(plan.entries[y].kind, AllocKind::Allocate);
    }

    #[test]
    fn test_reuse_requires_equal_size() {
        let mut g = typed_chain();
        g.set_node_arg(NodeArg::typed("c", ElementType::F32, &[8]));
        let (plan, _) = plan_for(&g, true);
        assert_eq!(plan.num_reused(), 0);
    }

    #[test]
    fn test_unknown_shapes_not_reused() {
        let mut g = Graph::new("g");
        g.add_input(NodeArg::new("x"));
        g.add_node("n1", "Relu", &["x"], &["a"]);
        g.add_node("n2", "Relu", &["a"], &["b"]);
        g.add_node("n3", "Relu", &["b"], &["y"]);
        g.add_output("y");
        place_all(&mut g, "cpu");
        let (plan, _) = plan_for(&g, true);
        assert_eq!(plan.num_reused(), 0);
    }

    #[test]
    fn test_initializer_and_external_never_reused() {
        let mut g = Graph::new("g");
        g.add_input(NodeArg::typed("x", ElementType::F32, &[4]));
        g.add_initializer("w", Tensor::zeros(&[4]));
        g.add_node("n1", "Mul", &["x", "w"], &["a"]);
        g.add_node("n2", "Relu", &["a"], &["b"]);
        g.add_node("n3", "Relu", &["b"], &["y"]);
        g.set_node_arg(NodeArg::typed("a", ElementType::F32, &[4]));
        g.set_node_arg(NodeArg::typed("b", ElementType::F32, &[4]));
        g.add_output("y");
        place_all(&mut g, "cpu");
        let (plan, values) = plan_for(&g, true);
        let w = values.index("w").unwrap();
        assert_eq!(plan.entries[w].kind, AllocKind::Initializer);
        for entry in &plan.entries {
            if let AllocKind::Reuse(src) = entry.kind {
                assert_ne!(src, w);
                assert_ne!(src, values.index("x").unwrap());
            }
        }
    }

    #[test]
    fn test_parallel_plan_never_reuses() {
        let g = typed_chain();
        let (plan, _) = plan_for(&g, false);
        assert!(!plan.allows_reuse);
        assert!(plan
            .entries
            .iter()
            .all(|e| !matches!(e.kind, AllocKind::Reuse(_))));
    }
}
