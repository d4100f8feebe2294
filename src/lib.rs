pub mod backend;
pub mod engine;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod memory;
pub mod model;
pub mod tensor;

#[cfg(feature = "cli")]
pub mod cli;

pub use backend::{resolve_backend, select_backends, ExecutionBackend};
pub use engine::{InferenceSession, RunOptions, SessionOptions, SessionStatus};
pub use error::RuntimeError;
pub use graph::{Graph, NodeArg};
pub use kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};
pub use model::{JsonModel, ModelSource};
pub use tensor::{ElementType, Tensor, TensorValue, Value};
