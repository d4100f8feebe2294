use std::collections::HashMap;

use tracing::debug;

use crate::error::RuntimeError;

use super::Graph;

/// A graph-rewriting pass.
pub trait GraphTransformer: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrite `graph` in place. Returns whether anything changed.
    fn apply(&self, graph: &mut Graph) -> Result<bool, RuntimeError>;
}

/// Removes `Identity` nodes by rewiring their consumers to the identity's input.
///
/// An identity whose output is a graph output is kept so the output name survives.
pub struct IdentityElimination;

impl GraphTransformer for IdentityElimination {
    fn name(&self) -> &str {
        "IdentityElimination"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool, RuntimeError> {
        let candidates: Vec<usize> = graph
            .nodes()
            .filter(|n| n.op_type == "Identity" && n.inputs.len() == 1 && n.outputs.len() == 1)
            .filter(|n| !n.inputs[0].is_empty() && !graph.is_graph_output(&n.outputs[0]))
            .map(|n| n.index)
            .collect();

        let mut modified = false;
        for index in candidates {
            // Earlier removals may have rewired this node's input.
            let Some(node) = graph.node(index) else {
                continue;
            };
            let (input, output) = (node.inputs[0].clone(), node.outputs[0].clone());
            let replacements = HashMap::from([(output.clone(), input.clone())]);
            for consumer in graph.consumers_of(&output) {
                if let Some(node) = graph.node_mut(consumer) {
                    node.replace_defs(&replacements);
                }
            }
            graph.remove_node(index);
            debug!(output = %output, input = %input, "Eliminated Identity node");
            modified = true;
        }
        Ok(modified)
    }
}
