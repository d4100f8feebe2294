use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model was not loaded")]
    NotLoaded,

    #[error("Session not initialized")]
    NotInitialized,

    #[error("Model parse error: {0}")]
    ParseFailure(String),

    #[error("Kernel creation failed for operator '{op_type}' on backend '{backend}'")]
    KernelCreationFailure { op_type: String, backend: String },

    #[error("Out of memory: failed to allocate {requested} bytes on {location}")]
    OutOfMemory { requested: usize, location: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Execution failed at node '{node}' ({op_type}): {source}")]
    ExecutionFailure {
        node: String,
        op_type: String,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("Run timed out after {0} ms")]
    Timeout(u64),

    #[error("Unsupported placement: backend '{backend}' cannot exchange data for operator '{op_type}'")]
    UnsupportedPlacement { backend: String, op_type: String },

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Backend error: {0}")]
    Backend(String),
}

impl RuntimeError {
    /// Wrap a kernel-side error with the node it came from.
    pub fn execution(node: &str, op_type: &str, source: RuntimeError) -> Self {
        RuntimeError::ExecutionFailure {
            node: node.to_string(),
            op_type: op_type.to_string(),
            source: Box::new(source),
        }
    }
}
