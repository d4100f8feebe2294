//! Immutable per-session state shared by every run.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::backend::ExecutionBackend;
use crate::error::RuntimeError;
use crate::graph::{Graph, NodeIndex};
use crate::kernel::{KernelRegistry, OpKernel};
use crate::memory::{AllocatorInfo, AllocatorPtr};
use crate::tensor::TensorValue;

use super::options::SessionOptions;
use super::pattern::MemoryPattern;
use super::plan::{create_plan, AllocationPlan, PlannerContext, ValueIndex, ValueIndexMap};

/// Feed shapes keyed by value index, used to look up a cached memory pattern.
pub type PatternKey = Vec<(ValueIndex, Vec<usize>)>;

/// Node-level dependencies for the parallel executor.
#[derive(Debug, Clone, Default)]
pub struct DependencyTable {
    /// Number of distinct producer nodes each node waits for.
    pub upstream_count: HashMap<NodeIndex, usize>,
    /// Nodes that read at least one output of each node.
    pub downstream: HashMap<NodeIndex, Vec<NodeIndex>>,
}

impl DependencyTable {
    pub fn build(graph: &Graph, order: &[NodeIndex]) -> Self {
        let mut table = Self::default();
        for &index in order {
            let Some(node) = graph.node(index) else {
                continue;
            };
            let mut producers: Vec<NodeIndex> = node
                .existing_inputs()
                .filter_map(|name| graph.producer_of(name))
                .filter(|&p| p != index)
                .collect();
            producers.sort_unstable();
            producers.dedup();
            table.upstream_count.insert(index, producers.len());
            table.downstream.entry(index).or_default();
            for producer in producers {
                table.downstream.entry(producer).or_default().push(index);
            }
        }
        table
    }

    /// Nodes with no upstream producers, in ascending index order.
    pub fn roots(&self) -> Vec<NodeIndex> {
        let mut roots: Vec<NodeIndex> = self
            .upstream_count
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&node, _)| node)
            .collect();
        roots.sort_unstable();
        roots
    }
}

pub struct SessionState {
    graph: Graph,
    values: ValueIndexMap,
    kernels: HashMap<NodeIndex, Box<dyn OpKernel>>,
    sequential_plan: AllocationPlan,
    parallel_plan: AllocationPlan,
    allocators: BTreeMap<AllocatorInfo, AllocatorPtr>,
    initializers: Vec<(ValueIndex, TensorValue)>,
    input_indices: Vec<ValueIndex>,
    dependencies: DependencyTable,
    patterns: Mutex<HashMap<PatternKey, Arc<MemoryPattern>>>,
    enable_mem_pattern: bool,
}

impl SessionState {
    /// Build the runtime state for a transformed and placed graph.
    pub fn build(
        graph: Graph,
        backends: &[Arc<dyn ExecutionBackend>],
        kernels: &KernelRegistry,
        options: &SessionOptions,
    ) -> Result<Self, RuntimeError> {
        let order = graph.topological_order()?;
        let values = ValueIndexMap::build(&graph, &order);
        let locations: HashMap<String, AllocatorInfo> = backends
            .iter()
            .map(|b| (b.name().to_string(), b.allocator_info().clone()))
            .collect();

        let mut node_kernels = HashMap::with_capacity(order.len());
        for &index in &order {
            let node = graph
                .node(index)
                .ok_or_else(|| RuntimeError::Graph(format!("node {} vanished", index)))?;
            let location = locations.get(&node.backend).ok_or_else(|| {
                RuntimeError::UnsupportedPlacement {
                    backend: node.backend.clone(),
                    op_type: node.op_type.clone(),
                }
            })?;
            node_kernels.insert(index, kernels.create_kernel(node, location)?);
        }

        let ctx = PlannerContext {
            graph: &graph,
            values: &values,
            execution_order: &order,
            kernels,
            locations: &locations,
        };
        let sequential_plan = create_plan(&ctx, true)?;
        let parallel_plan = create_plan(&ctx, false)?;

        let mut allocators = BTreeMap::new();
        for backend in backends {
            let info = backend.allocator_info();
            if !allocators.contains_key(info) {
                allocators.insert(info.clone(), backend.create_allocator(&options.arena)?);
            }
        }
        if !allocators.contains_key(&AllocatorInfo::cpu()) {
            return Err(RuntimeError::Backend(
                "no backend provides host memory".to_string(),
            ));
        }

        let mut initializers = Vec::with_capacity(graph.initializers().len());
        for (name, tensor) in graph.initializers() {
            let Some(index) = values.index(name) else {
                continue;
            };
            let location = &sequential_plan.entries[index].location;
            let backend = backends
                .iter()
                .find(|b| b.allocator_info() == location)
                .ok_or_else(|| {
                    RuntimeError::Backend(format!(
                        "no backend owns {} memory for initializer '{}'",
                        location, name
                    ))
                })?;
            let allocator = allocators.get(location).ok_or_else(|| {
                RuntimeError::Backend(format!("no allocator for {}", location))
            })?;
            initializers.push((index, backend.upload(tensor, allocator)?));
        }

        let input_indices = graph
            .inputs()
            .iter()
            .filter_map(|name| values.index(name))
            .collect();
        let dependencies = DependencyTable::build(&graph, &order);

        info!(
            graph = %graph.name,
            nodes = order.len(),
            values = values.len(),
            reused = sequential_plan.num_reused(),
            initializers = initializers.len(),
            "Session state ready"
        );
        Ok(Self {
            graph,
            values,
            kernels: node_kernels,
            sequential_plan,
            parallel_plan,
            allocators,
            initializers,
            input_indices,
            dependencies,
            patterns: Mutex::new(HashMap::new()),
            enable_mem_pattern: options.enable_mem_pattern,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn values(&self) -> &ValueIndexMap {
        &self.values
    }

    pub fn value_index(&self, name: &str) -> Option<ValueIndex> {
        self.values.index(name)
    }

    pub fn value_name(&self, index: ValueIndex) -> &str {
        self.values.name(index).unwrap_or("<unknown>")
    }

    /// The sequential plan (with buffer reuse) or the parallel one (without).
    pub fn plan(&self, sequential: bool) -> &AllocationPlan {
        if sequential {
            &self.sequential_plan
        } else {
            &self.parallel_plan
        }
    }

    pub fn kernel(&self, node: NodeIndex) -> Result<&dyn OpKernel, RuntimeError> {
        self.kernels
            .get(&node)
            .map(|k| k.as_ref())
            .ok_or_else(|| RuntimeError::Graph(format!("no kernel for node {}", node)))
    }

    pub fn allocator(&self, location: &AllocatorInfo) -> Result<&AllocatorPtr, RuntimeError> {
        self.allocators
            .get(location)
            .ok_or_else(|| RuntimeError::Backend(format!("no allocator for {}", location)))
    }

    pub fn initializer_values(&self) -> &[(ValueIndex, TensorValue)] {
        &self.initializers
    }

    pub fn input_indices(&self) -> &[ValueIndex] {
        &self.input_indices
    }

    pub fn dependencies(&self) -> &DependencyTable {
        &self.dependencies
    }

    pub fn mem_pattern_enabled(&self) -> bool {
        self.enable_mem_pattern
    }

    pub fn cached_pattern(&self, key: &PatternKey) -> Option<Arc<MemoryPattern>> {
        self.patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn store_pattern(&self, key: PatternKey, pattern: MemoryPattern) {
        debug!(
            shapes = ?key,
            blocks = pattern.num_blocks(),
            "Cached memory pattern"
        );
        self.patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| Arc::new(pattern));
    }

    pub fn num_cached_patterns(&self) -> usize {
        self.patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{CpuBackend, EmulatedBackend};
    use crate::graph::NodeArg;
    use crate::tensor::{ElementType, Tensor};

    fn build(graph: Graph, backends: Vec<Arc<dyn ExecutionBackend>>) -> Result<SessionState, RuntimeError> {
        let mut kernels = KernelRegistry::new();
        for backend in &backends {
            backend.register_kernels(&mut kernels);
        }
        SessionState::build(graph, &backends, &kernels, &SessionOptions::default())
    }

    /// x -> a -> b -> c -> y, Relu nodes on cpu, all [4] f32.
    pub(crate) fn typed_chain_state() -> SessionState {
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
        for node in g.nodes_mut() {
            node.backend = "cpu".into();
        }
        build(g, vec![Arc::new(CpuBackend::new())]).unwrap()
    }

    #[test]
    fn test_build_chain() {
        let state = typed_chain_state();
        assert_eq!(state.values().len(), 5);
        assert_eq!(state.input_indices(), &[0]);
        assert!(state.kernel(0).is_ok());
        assert!(state.kernel(42).is_err());
        assert!(state.allocator(&AllocatorInfo::cpu()).is_ok());
        assert!(state.plan(true).allows_reuse);
        assert!(!state.plan(false).allows_reuse);
    }

    #[test]
    fn test_dependencies() {
        let state = typed_chain_state();
        let deps = state.dependencies();
        assert_eq!(deps.roots(), vec![0]);
        assert_eq!(deps.upstream_count[&3], 1);
        assert_eq!(deps.downstream[&0], vec![1]);
        assert!(deps.downstream[&3].is_empty());
    }

    #[test]
    fn test_diamond_counts_distinct_producers() {
        let mut g = Graph::new("diamond");
        g.add_input(NodeArg::new("x"));
        g.add_node("split", "Relu", &["x"], &["a"]);
        g.add_node("left", "Relu", &["a"], &["l"]);
        g.add_node("right", "Relu", &["a"], &["r"]);
        g.add_node("join", "Add", &["l", "r"], &["y"]);
        g.add_node("square", "Mul", &["y", "y"], &["z"]);
        g.add_output("z");
        let order = g.topological_order().unwrap();
        let deps = DependencyTable::build(&g, &order);
        assert_eq!(deps.upstream_count[&3], 2);
        assert_eq!(deps.upstream_count[&4], 1);
        assert_eq!(deps.downstream[&0], vec![1, 2]);
    }

    #[test]
    fn test_initializer_uploaded_to_consumer_location() {
        let mut g = Graph::new("g");
        g.add_input(NodeArg::new("x"));
        g.add_initializer("w", Tensor::new(vec![2], vec![1.0, 2.0]));
        g.add_node("mul", "Mul", &["x", "w"], &["y"]);
        g.add_output("y");
        for node in g.nodes_mut() {
            node.backend = "emulated".into();
        }
        let state = build(
            g,
            vec![Arc::new(EmulatedBackend::new(0)), Arc::new(CpuBackend::new())],
        )
        .unwrap();
        let (_, w) = &state.initializer_values()[0];
        assert_eq!(w.location().name, "Emulated");
        assert_eq!(w.as_f32().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_unknown_backend_placement() {
        let mut g = Graph::new("g");
        g.add_input(NodeArg::new("x"));
        g.add_node("r", "Relu", &["x"], &["y"]);
        g.add_output("y");
        for node in g.nodes_mut() {
            node.backend = "tpu".into();
        }
        let err = build(g, vec![Arc::new(CpuBackend::new())]).err().unwrap();
        assert!(matches!(err, RuntimeError::UnsupportedPlacement { .. }));
    }

    #[test]
    fn test_pattern_cache() {
        let state = typed_chain_state();
        let key: PatternKey = vec![(0, vec![4])];
        assert!(state.cached_pattern(&key).is_none());
        state.store_pattern(key.clone(), MemoryPattern::default());
        assert!(state.cached_pattern(&key).is_some());
        assert_eq!(state.num_cached_patterns(), 1);
    }
}
