//! Shared CLI utilities for the strata-run binary.

pub mod backend;

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;

use crate::model::TensorData;
use crate::tensor::Value;

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read feed JSON from a file, or from stdin when no file is given.
pub fn read_feeds_text(file: Option<&Path>) -> Result<String, String> {
    if let Some(path) = file {
        return std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e));
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("Failed to read stdin: {}", e))?;
    Ok(buf)
}

/// Parse `{"x": {"dtype": "f32", "shape": [2], "data": [1, 2]}, ...}` into host values.
pub fn parse_feeds(text: &str) -> Result<HashMap<String, Value>, String> {
    let raw: BTreeMap<String, TensorData> =
        serde_json::from_str(text).map_err(|e| format!("Invalid feeds JSON: {}", e))?;
    let mut feeds = HashMap::with_capacity(raw.len());
    for (name, mut data) in raw {
        data.name = name.clone();
        let tensor = data.to_tensor().map_err(|e| e.to_string())?;
        let value = Value::from_tensor(&tensor).map_err(|e| e.to_string())?;
        feeds.insert(name, value);
    }
    Ok(feeds)
}

/// Convert run outputs back to tensor literals, sorted by name.
pub fn outputs_to_json(outputs: &HashMap<String, Value>) -> Result<BTreeMap<String, TensorData>, String> {
    let mut out = BTreeMap::new();
    for (name, value) in outputs {
        let tensor = value.to_tensor().map_err(|e| format!("Output '{}': {}", name, e))?;
        let mut data = TensorData::from_tensor(name.clone(), &tensor);
        data.name.clear();
        out.insert(name.clone(), data);
    }
    Ok(out)
}
