//! Session runtime: planning, per-run frames, executors, and the session itself.
//!
//! - [`InferenceSession`]: load → initialize → run
//! - [`SessionState`]: placed graph, kernels, plans, and allocators shared by all runs
//! - [`ExecutionFrame`]: one run's values
//! - [`SequentialExecutor`] / [`ParallelExecutor`]

pub mod executor;
pub mod frame;
pub mod options;
pub mod pattern;
pub mod plan;
pub mod session;
pub mod state;

pub use executor::{Executor, ParallelExecutor, SequentialExecutor};
pub use frame::{BufferSource, ExecutionFrame, PatternMode};
pub use options::{RunOptions, SessionOptions};
pub use pattern::{MemoryPattern, PatternPlanner};
pub use plan::{AllocKind, AllocationPlan, ValueIndex, ValueIndexMap};
pub use session::{InferenceSession, SessionStatus};
pub use state::SessionState;
