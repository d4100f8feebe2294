//! Model sources: anything that can produce a [`Graph`] for a session to load.

mod json;

pub use json::{JsonModel, JsonNode, TensorData};

use crate::error::RuntimeError;
use crate::graph::Graph;

/// Produces the graph a session loads.
pub trait ModelSource {
    fn load_graph(self) -> Result<Graph, RuntimeError>;
}

impl ModelSource for Graph {
    fn load_graph(self) -> Result<Graph, RuntimeError> {
        Ok(self)
    }
}
