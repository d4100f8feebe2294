//! Inserts copy nodes where data crosses into or out of a device backend.
//!
//! For a target backend B, every arg that B reads but host code writes gets a
//! `MemcpyFromHost` node on B, and every arg B writes but host code reads gets a
//! `MemcpyToHost` node on B. Initializers read by both sides are duplicated so each side
//! owns a copy in its own memory. Afterwards no B node shares an arg with a node on
//! another backend except through a copy node.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::RuntimeError;
use crate::kernel::KernelRegistry;

use super::{Graph, GraphTransformer, NodeArg, NodeIndex};

pub const MEMCPY_FROM_HOST: &str = "MemcpyFromHost";
pub const MEMCPY_TO_HOST: &str = "MemcpyToHost";

/// Device-placement pass for one non-host backend.
pub struct MemcpyTransformer<'a> {
    backend: String,
    host_backend: String,
    registry: &'a KernelRegistry,
}

#[derive(Default)]
struct ArgClasses {
    provider_inputs: BTreeSet<String>,
    provider_outputs: BTreeSet<String>,
    non_provider_inputs: BTreeSet<String>,
    non_provider_outputs: BTreeSet<String>,
    /// Args read or written by nodes on a third, non-host backend: arg -> (backend, op).
    foreign_readers: HashMap<String, (String, String)>,
    foreign_writers: HashMap<String, (String, String)>,
    provider_nodes: Vec<NodeIndex>,
}

impl<'a> MemcpyTransformer<'a> {
    pub fn new(backend: &str, host_backend: &str, registry: &'a KernelRegistry) -> Self {
        Self {
            backend: backend.to_string(),
            host_backend: host_backend.to_string(),
            registry,
        }
    }

    fn classify(&self, graph: &Graph) -> ArgClasses {
        let mut classes = ArgClasses::default();
        for node in graph.nodes() {
            if node.backend == self.backend {
                classes.provider_nodes.push(node.index);
                let def = self
                    .registry
                    .lookup(&self.backend, &node.op_type)
                    .map(|k| &k.def);
                for (i, arg) in node.inputs.iter().enumerate().filter(|(_, a)| !a.is_empty()) {
                    if def.map_or(false, |d| d.is_input_on_host(i)) {
                        classes.non_provider_inputs.insert(arg.clone());
                    } else {
                        classes.provider_inputs.insert(arg.clone());
                    }
                }
                for (i, arg) in node.outputs.iter().enumerate().filter(|(_, a)| !a.is_empty()) {
                    if def.map_or(false, |d| d.is_output_on_host(i)) {
                        classes.non_provider_outputs.insert(arg.clone());
                    } else {
                        classes.provider_outputs.insert(arg.clone());
                    }
                }
            } else {
                let foreign = node.backend != self.host_backend;
                for arg in node.existing_inputs() {
                    classes.non_provider_inputs.insert(arg.to_string());
                    if foreign {
                        classes
                            .foreign_readers
                            .insert(arg.to_string(), (node.backend.clone(), node.op_type.clone()));
                    }
                }
                for arg in node.existing_outputs() {
                    classes.non_provider_outputs.insert(arg.to_string());
                    if foreign {
                        classes
                            .foreign_writers
                            .insert(arg.to_string(), (node.backend.clone(), node.op_type.clone()));
                    }
                }
            }
        }
        for input in graph.inputs() {
            classes.non_provider_outputs.insert(input.clone());
        }
        for output in graph.outputs() {
            classes.non_provider_inputs.insert(output.clone());
        }
        classes
    }

    /// Args that would flow directly between B and another device backend.
    fn check_foreign(&self, classes: &ArgClasses) -> Result<(), RuntimeError> {
        let crossing = classes
            .provider_inputs
            .iter()
            .filter_map(|arg| classes.foreign_writers.get(arg))
            .chain(
                classes
                    .provider_outputs
                    .iter()
                    .filter_map(|arg| classes.foreign_readers.get(arg)),
            )
            .next();
        match crossing {
            Some((backend, op_type)) => Err(RuntimeError::UnsupportedPlacement {
                backend: backend.clone(),
                op_type: op_type.clone(),
            }),
            None => Ok(()),
        }
    }

    fn fresh_arg(&self, graph: &mut Graph, original: &str) -> String {
        let name = graph.generate_node_arg_name(&format!("{}_{}", original, self.backend));
        let info = graph.node_arg(original).cloned().unwrap_or_default();
        graph.set_node_arg(NodeArg {
            name: name.clone(),
            ..info
        });
        name
    }

    fn add_copy_node(&self, graph: &mut Graph, op_type: &str, input: &str, output: &str) {
        let name = graph.generate_node_name("Memcpy");
        let index = graph.add_node(&name, op_type, &[input], &[output]);
        if let Some(node) = graph.node_mut(index) {
            node.backend = self.backend.clone();
        }
        debug!(backend = %self.backend, op = op_type, input, output, "Inserted copy node");
    }
}

impl GraphTransformer for MemcpyTransformer<'_> {
    fn name(&self) -> &str {
        "MemcpyTransformer"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool, RuntimeError> {
        let classes = self.classify(graph);
        self.check_foreign(&classes)?;

        let mut replacements: HashMap<String, String> = HashMap::new();

        // Initializers read on both sides: B gets its own copy.
        let shared_initializers: Vec<String> = classes
            .provider_inputs
            .iter()
            .filter(|a| graph.is_initializer(a) && classes.non_provider_inputs.contains(*a))
            .cloned()
            .collect();
        for arg in shared_initializers {
            let Some(tensor) = graph.initializer(&arg).cloned() else {
                continue;
            };
            let dup = self.fresh_arg(graph, &arg);
            graph.add_initializer(&dup, tensor);
            debug!(backend = %self.backend, initializer = %arg, duplicate = %dup, "Duplicated initializer");
            replacements.insert(arg, dup);
        }

        for arg in classes
            .non_provider_outputs
            .intersection(&classes.provider_inputs)
        {
            let device_arg = self.fresh_arg(graph, arg);
            self.add_copy_node(graph, MEMCPY_FROM_HOST, arg, &device_arg);
            replacements.insert(arg.clone(), device_arg);
        }

        for arg in classes
            .provider_outputs
            .intersection(&classes.non_provider_inputs)
        {
            let device_arg = self.fresh_arg(graph, arg);
            self.add_copy_node(graph, MEMCPY_TO_HOST, &device_arg, arg);
            replacements.insert(arg.clone(), device_arg);
        }

        if replacements.is_empty() {
            return Ok(false);
        }
        for &index in &classes.provider_nodes {
            if let Some(node) = graph.node_mut(index) {
                node.replace_defs(&replacements);
            }
        }
        Ok(true)
    }
}
