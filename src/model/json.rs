//! JSON model format.
//!
//! ```json
//! {
//!   "name": "chain",
//!   "inputs": [{"name": "x", "dtype": "f32", "shape": [null, 4]}],
//!   "outputs": ["y"],
//!   "initializers": [{"name": "w", "dtype": "f32", "shape": [4], "data": [1, 2, 3, 4]}],
//!   "nodes": [
//!     {"name": "mul", "op_type": "Mul", "inputs": ["x", "w"], "outputs": ["y"],
//!      "backend": "emulated"}
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RuntimeError;
use crate::graph::{AttributeValue, Graph, NodeArg};
use crate::tensor::{element_count, ElementType, Tensor, TensorStorage};

use super::ModelSource;

/// A dense tensor literal: element type, shape, and values in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub dtype: ElementType,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl TensorData {
    pub fn from_tensor(name: impl Into<String>, tensor: &Tensor) -> Self {
        let data = match tensor.storage() {
            TensorStorage::F32(d) => d.iter().map(|&v| v as f64).collect(),
            TensorStorage::F16(_) => tensor.to_f32().as_f32().iter().map(|&v| v as f64).collect(),
            TensorStorage::I32(d) => d.iter().map(|&v| v as f64).collect(),
            TensorStorage::I64(d) => d.iter().map(|&v| v as f64).collect(),
            TensorStorage::U8(d) => d.iter().map(|&v| v as f64).collect(),
        };
        Self {
            name: name.into(),
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            data,
        }
    }

    /// Convert to a tensor. The value count must match the shape.
    pub fn to_tensor(&self) -> Result<Tensor, RuntimeError> {
        let n = element_count(&self.shape)?;
        if n != self.data.len() {
            return Err(RuntimeError::ParseFailure(format!(
                "tensor '{}' has shape {:?} ({} elements) but {} values",
                self.name,
                self.shape,
                n,
                self.data.len()
            )));
        }
        let shape = self.shape.clone();
        let tensor = match self.dtype {
            ElementType::F32 => Tensor::new(shape, self.data.iter().map(|&v| v as f32).collect()),
            ElementType::F16 => Tensor::from_f16(
                shape,
                self.data
                    .iter()
                    .map(|&v| half::f16::from_f64(v).to_bits())
                    .collect(),
            ),
            ElementType::I32 => Tensor::from_i32(shape, self.data.iter().map(|&v| v as i32).collect()),
            ElementType::I64 => Tensor::from_i64(shape, self.data.iter().map(|&v| v as i64).collect()),
            ElementType::U8 => Tensor::from_u8(shape, self.data.iter().map(|&v| v as u8).collect()),
        };
        Ok(tensor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonNode {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Pin the node to a backend instead of letting placement choose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonModel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<NodeArg>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub initializers: Vec<TensorData>,
    #[serde(default)]
    pub nodes: Vec<JsonNode>,
    /// Extra type and shape annotations for intermediate args.
    #[serde(default)]
    pub value_info: Vec<NodeArg>,
}

impl JsonModel {
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path)?;
        let model = Self::from_str(&text).map_err(|e| match e {
            RuntimeError::ParseFailure(msg) => {
                RuntimeError::ParseFailure(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        debug!(path = %path.display(), nodes = model.nodes.len(), "Read JSON model");
        Ok(model)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(text).map_err(|e| RuntimeError::ParseFailure(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, RuntimeError> {
        serde_json::to_string_pretty(self).map_err(|e| RuntimeError::ParseFailure(e.to_string()))
    }
}

impl ModelSource for JsonModel {
    fn load_graph(self) -> Result<Graph, RuntimeError> {
        let mut graph = Graph::new(if self.name.is_empty() { "model" } else { &self.name });
        for arg in self.inputs {
            graph.add_input(arg);
        }
        for init in &self.initializers {
            if init.name.is_empty() {
                return Err(RuntimeError::ParseFailure("initializer without a name".into()));
            }
            graph.add_initializer(&init.name, init.to_tensor()?);
        }
        for (i, node) in self.nodes.into_iter().enumerate() {
            let name = if node.name.is_empty() {
                graph.generate_node_name(&format!("{}_{}", node.op_type, i))
            } else {
                node.name
            };
            let inputs: Vec<&str> = node.inputs.iter().map(String::as_str).collect();
            let outputs: Vec<&str> = node.outputs.iter().map(String::as_str).collect();
            let index = graph.add_node(&name, &node.op_type, &inputs, &outputs);
            if let Some(placed) = graph.node_mut(index) {
                placed.attributes = node.attributes;
                placed.backend = node.backend.unwrap_or_default();
            }
        }
        for arg in self.value_info {
            graph.set_node_arg(arg);
        }
        for name in &self.outputs {
            graph.add_output(name);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = r#"{
        "name": "chain",
        "inputs": [{"name": "x", "dtype": "f32", "shape": [4]}],
        "outputs": ["y"],
        "initializers": [{"name": "w", "dtype": "f32", "shape": [4], "data": [1, 2, 3, 4]}],
        "nodes": [
            {"name": "a", "op_type": "Relu", "inputs": ["x"], "outputs": ["t"]},
            {"name": "b", "op_type": "Mul", "inputs": ["t", "w"], "outputs": ["u"],
             "backend": "emulated"},
            {"name": "c", "op_type": "Scale", "inputs": ["u"], "outputs": ["y"],
             "attributes": {"factor": 0.5}}
        ],
        "value_info": [{"name": "t", "dtype": "f32", "shape": [4]}]
    }"#;

    #[test]
    fn test_parse_chain() {
        let graph = JsonModel::from_str(CHAIN).unwrap().load_graph().unwrap();
        assert_eq!(graph.name, "chain");
        assert_eq!(graph.num_nodes(), 3);
        assert_eq!(graph.inputs(), &["x".to_string()]);
        assert_eq!(graph.outputs(), &["y".to_string()]);
        assert_eq!(graph.initializer("w").unwrap().as_f32(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(graph.find_node("b").unwrap().backend, "emulated");
        assert_eq!(graph.find_node("c").unwrap().attr_float("factor"), Some(0.5));
        assert_eq!(graph.node_arg("t").unwrap().static_shape(), Some(vec![4]));
        graph.validate().unwrap();
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            JsonModel::from_str("{\"nodes\": 3}"),
            Err(RuntimeError::ParseFailure(_))
        ));
    }

    #[test]
    fn test_initializer_length_mismatch() {
        let model = JsonModel {
            initializers: vec![TensorData {
                name: "w".into(),
                dtype: ElementType::F32,
                shape: vec![3],
                data: vec![1.0],
            }],
            ..Default::default()
        };
        assert!(matches!(model.load_graph(), Err(RuntimeError::ParseFailure(_))));
    }

    #[test]
    fn test_tensor_data_dtypes() {
        let data = TensorData {
            name: "i".into(),
            dtype: ElementType::I64,
            shape: vec![2],
            data: vec![-3.0, 7.0],
        };
        let t = data.to_tensor().unwrap();
        assert_eq!(t.storage(), &TensorStorage::I64(vec![-3, 7]));
        assert_eq!(TensorData::from_tensor("i", &t), data);

        let h = TensorData {
            name: "h".into(),
            dtype: ElementType::F16,
            shape: vec![2],
            data: vec![0.5, -2.0],
        };
        assert_eq!(h.to_tensor().unwrap().to_f32().as_f32(), &[0.5, -2.0]);
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, CHAIN).unwrap();
        let model = JsonModel::from_file(&path).unwrap();
        let again = JsonModel::from_str(&model.to_json().unwrap()).unwrap();
        assert_eq!(model, again);
        assert!(matches!(
            JsonModel::from_file(&dir.path().join("missing.json")),
            Err(RuntimeError::Io(_))
        ));
    }
}
