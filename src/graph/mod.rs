//! Graph IR: named edges ([`NodeArg`]), operator nodes, and constant initializers.
//!
//! Nodes live in a slot vector so indices stay stable while transformers add and remove
//! nodes. Edges are referenced by name; a node's empty input name marks a missing
//! optional argument.

pub mod memcpy;
pub mod transformer;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RuntimeError;
use crate::tensor::{byte_size, ElementType, Tensor};

pub use memcpy::MemcpyTransformer;
pub use transformer::{GraphTransformer, IdentityElimination};

pub type NodeIndex = usize;

/// Named, optionally typed graph edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeArg {
    pub name: String,
    #[serde(default, rename = "dtype")]
    pub elem_type: Option<ElementType>,
    /// Dimensions; `None` entries are unknown until run time.
    #[serde(default)]
    pub shape: Option<Vec<Option<usize>>>,
}

impl NodeArg {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elem_type: None,
            shape: None,
        }
    }

    pub fn typed(name: impl Into<String>, elem_type: ElementType, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            elem_type: Some(elem_type),
            shape: Some(shape.iter().map(|&d| Some(d)).collect()),
        }
    }

    /// False for the placeholder of a missing optional argument.
    pub fn exists(&self) -> bool {
        !self.name.is_empty()
    }

    /// The shape when every dimension is known.
    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.shape.as_ref()?.iter().copied().collect()
    }

    /// Byte size when both element type and every dimension are known.
    pub fn static_byte_size(&self) -> Option<usize> {
        let shape = self.static_shape()?;
        byte_size(self.elem_type?, &shape).ok()
    }
}

impl PartialEq for NodeArg {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for NodeArg {}

impl Hash for NodeArg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Node attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

/// One operator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub index: NodeIndex,
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Backend name; empty until placement.
    pub backend: String,
}

impl Node {
    /// Rename inputs and outputs found in `replacements`.
    pub fn replace_defs(&mut self, replacements: &HashMap<String, String>) {
        for arg in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if let Some(new_name) = replacements.get(arg) {
                *arg = new_name.clone();
            }
        }
    }

    pub fn attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name)? {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float attribute; integer literals are accepted.
    pub fn attr_float(&self, name: &str) -> Option<f64> {
        match self.attributes.get(name)? {
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn attr_string(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name)? {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Inputs that are present (non-empty names).
    pub fn existing_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(String::as_str).filter(|s| !s.is_empty())
    }

    pub fn existing_outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(String::as_str).filter(|s| !s.is_empty())
    }
}

/// A computation graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    nodes: Vec<Option<Node>>,
    node_args: BTreeMap<String, NodeArg>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    initializers: BTreeMap<String, Tensor>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Declare a graph input. Type and shape on `arg` are merged into the arg table.
    pub fn add_input(&mut self, arg: NodeArg) {
        let name = arg.name.clone();
        self.set_node_arg(arg);
        if !self.inputs.contains(&name) {
            self.inputs.push(name);
        }
    }

    pub fn add_output(&mut self, name: &str) {
        self.get_or_create_node_arg(name);
        if !self.outputs.iter().any(|o| o == name) {
            self.outputs.push(name.to_string());
        }
    }

    /// Insert or update type information for an arg.
    pub fn set_node_arg(&mut self, arg: NodeArg) {
        let entry = self.get_or_create_node_arg(&arg.name);
        if arg.elem_type.is_some() {
            entry.elem_type = arg.elem_type;
        }
        if arg.shape.is_some() {
            entry.shape = arg.shape;
        }
    }

    pub fn add_node(
        &mut self,
        name: &str,
        op_type: &str,
        inputs: &[&str],
        outputs: &[&str],
    ) -> NodeIndex {
        let index = self.nodes.len();
        let node = Node {
            index,
            name: name.to_string(),
            op_type: op_type.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            attributes: BTreeMap::new(),
            backend: String::new(),
        };
        for arg in inputs.iter().chain(outputs.iter()).filter(|a| !a.is_empty()) {
            self.get_or_create_node_arg(arg);
        }
        self.nodes.push(Some(node));
        index
    }

    /// Remove a node, returning it. Its args stay in the arg table.
    pub fn remove_node(&mut self, index: NodeIndex) -> Option<Node> {
        self.nodes.get_mut(index)?.take()
    }

    pub fn add_initializer(&mut self, name: &str, tensor: Tensor) {
        self.set_node_arg(NodeArg::typed(name, tensor.dtype(), tensor.shape()));
        self.initializers.insert(name.to_string(), tensor);
    }

    pub fn get_or_create_node_arg(&mut self, name: &str) -> &mut NodeArg {
        self.node_args
            .entry(name.to_string())
            .or_insert_with(|| NodeArg::new(name))
    }

    /// A fresh arg name derived from `base`.
    pub fn generate_node_arg_name(&self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut suffix = 1;
        while self.node_args.contains_key(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        candidate
    }

    /// A fresh node name derived from `base`.
    pub fn generate_node_name(&self, base: &str) -> String {
        let taken: HashSet<&str> = self.nodes().map(|n| n.name.as_str()).collect();
        let mut candidate = base.to_string();
        let mut suffix = 1;
        while taken.contains(candidate.as_str()) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        candidate
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index)?.as_ref()
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut Node> {
        self.nodes.get_mut(index)?.as_mut()
    }

    /// Live nodes in index order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut().flatten()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes().find(|n| n.name == name)
    }

    pub fn node_arg(&self, name: &str) -> Option<&NodeArg> {
        self.node_args.get(name)
    }

    pub fn node_args(&self) -> impl Iterator<Item = &NodeArg> {
        self.node_args.values()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn initializers(&self) -> &BTreeMap<String, Tensor> {
        &self.initializers
    }

    pub fn initializer(&self, name: &str) -> Option<&Tensor> {
        self.initializers.get(name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn is_graph_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|i| i == name)
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    /// The node that writes `arg`, if any.
    pub fn producer_of(&self, arg: &str) -> Option<NodeIndex> {
        self.nodes()
            .find(|n| n.outputs.iter().any(|o| o == arg))
            .map(|n| n.index)
    }

    /// Nodes that read `arg`, in index order.
    pub fn consumers_of(&self, arg: &str) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|n| n.inputs.iter().any(|i| i == arg))
            .map(|n| n.index)
            .collect()
    }

    /// Check that every edge has exactly one source and every output is reachable.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let mut produced: HashSet<&str> = HashSet::new();
        for node in self.nodes() {
            if node.op_type.is_empty() {
                return Err(RuntimeError::Graph(format!(
                    "node '{}' has no operator type",
                    node.name
                )));
            }
            for out in node.existing_outputs() {
                if !produced.insert(out) {
                    return Err(RuntimeError::Graph(format!(
                        "arg '{}' is produced by more than one node",
                        out
                    )));
                }
                if self.is_graph_input(out) || self.is_initializer(out) {
                    return Err(RuntimeError::Graph(format!(
                        "node '{}' overwrites graph input or initializer '{}'",
                        node.name, out
                    )));
                }
            }
        }
        let available = |name: &str| {
            produced.contains(name) || self.is_graph_input(name) || self.is_initializer(name)
        };
        for node in self.nodes() {
            if let Some(missing) = node.existing_inputs().find(|i| !available(i)) {
                return Err(RuntimeError::Graph(format!(
                    "input '{}' of node '{}' has no producer",
                    missing, node.name
                )));
            }
        }
        if let Some(missing) = self.outputs.iter().find(|o| !available(o)) {
            return Err(RuntimeError::Graph(format!(
                "graph output '{}' has no producer",
                missing
            )));
        }
        Ok(())
    }

    /// Node indices in dependency order. Ties are broken by node index.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, RuntimeError> {
        let producers: HashMap<&str, NodeIndex> = self
            .nodes()
            .flat_map(|n| n.existing_outputs().map(move |o| (o, n.index)))
            .collect();

        let mut pending: HashMap<NodeIndex, usize> = HashMap::new();
        let mut downstream: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for node in self.nodes() {
            let upstream: BTreeSet<NodeIndex> = node
                .existing_inputs()
                .filter_map(|i| producers.get(i).copied())
                .collect();
            pending.insert(node.index, upstream.len());
            for u in upstream {
                downstream.entry(u).or_default().push(node.index);
            }
        }

        let mut ready: BTreeSet<NodeIndex> = pending
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(pending.len());
        while let Some(index) = ready.pop_first() {
            order.push(index);
            for &d in downstream.get(&index).into_iter().flatten() {
                if let Some(count) = pending.get_mut(&d) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(d);
                    }
                }
            }
        }
        if order.len() != pending.len() {
            return Err(RuntimeError::Graph(format!(
                "graph '{}' contains a cycle",
                self.name
            )));
        }
        debug!(graph = %self.name, nodes = order.len(), "Computed topological order");
        Ok(order)
    }
}
