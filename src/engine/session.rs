//! The inference session: load a graph once, initialize it once, run it many times.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::{select_backends, CpuBackend, ExecutionBackend};
use crate::error::RuntimeError;
use crate::graph::{Graph, GraphTransformer, MemcpyTransformer};
use crate::kernel::{KernelDef, KernelInfo, KernelRegistry, OpKernel};
use crate::model::{JsonModel, ModelSource};
use crate::tensor::Value;

use super::executor::{Executor, ParallelExecutor, SequentialExecutor};
use super::options::{RunOptions, SessionOptions};
use super::state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Loaded,
    Initialized,
}

struct Inner {
    status: SessionStatus,
    graph: Option<Graph>,
    kernels: KernelRegistry,
    state: Option<Arc<SessionState>>,
}

/// Decrements the run counter when the caller stops waiting.
struct RunGuard<'a>(&'a AtomicUsize);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct InferenceSession {
    options: SessionOptions,
    backends: Vec<Arc<dyn ExecutionBackend>>,
    pool: rayon::ThreadPool,
    inner: RwLock<Inner>,
    num_runs: AtomicUsize,
}

impl InferenceSession {
    /// Create a session with the backends named in `options.backends`.
    pub fn new(options: SessionOptions) -> Result<Self, RuntimeError> {
        let backends = select_backends(&options.backends);
        Self::with_backends(options, backends)
    }

    /// Create a session with explicit backend instances, in placement preference order.
    pub fn with_backends(
        options: SessionOptions,
        mut backends: Vec<Arc<dyn ExecutionBackend>>,
    ) -> Result<Self, RuntimeError> {
        if !backends.iter().any(|b| b.is_host()) {
            backends.push(Arc::new(CpuBackend::new()));
        }
        let mut kernels = KernelRegistry::new();
        for backend in &backends {
            backend.register_kernels(&mut kernels);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_threads)
            .thread_name(|i| format!("strata-run-{}", i))
            .panic_handler(|payload| {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %msg, "Run job panicked");
            })
            .build()
            .map_err(|e| RuntimeError::Backend(format!("failed to build thread pool: {}", e)))?;
        info!(
            threads = pool.current_num_threads(),
            kernels = kernels.len(),
            "Created session"
        );
        Ok(Self {
            options,
            backends,
            pool,
            inner: RwLock::new(Inner {
                status: SessionStatus::Created,
                graph: None,
                kernels,
                state: None,
            }),
            num_runs: AtomicUsize::new(0),
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).status
    }

    /// Runs currently waited on by callers.
    pub fn current_num_runs(&self) -> usize {
        self.num_runs.load(Ordering::SeqCst)
    }

    /// Memory patterns cached so far, one per distinct set of feed shapes.
    pub fn num_memory_patterns(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.state.as_ref().map_or(0, |s| s.num_cached_patterns())
    }

    /// Load a graph. Only one load per session is allowed.
    pub fn load(&self, source: impl ModelSource) -> Result<(), RuntimeError> {
        let graph = source.load_graph()?;
        graph.validate()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.status != SessionStatus::Created {
            return Err(RuntimeError::InvalidArgument(
                "a model is already loaded in this session".to_string(),
            ));
        }
        info!(
            graph = %graph.name,
            nodes = graph.num_nodes(),
            initializers = graph.initializers().len(),
            "Loaded model"
        );
        inner.graph = Some(graph);
        inner.status = SessionStatus::Loaded;
        Ok(())
    }

    /// Load a JSON model file.
    pub fn load_from_file(&self, path: &Path) -> Result<(), RuntimeError> {
        self.load(JsonModel::from_file(path)?)
    }

    /// Add a kernel before initialization. Replaces an existing kernel for the same
    /// backend and operator.
    pub fn register_kernel<F>(&self, def: KernelDef, factory: F) -> Result<(), RuntimeError>
    where
        F: Fn(&KernelInfo<'_>) -> Result<Box<dyn OpKernel>, RuntimeError> + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.status == SessionStatus::Initialized {
            return Err(RuntimeError::InvalidArgument(
                "kernels must be registered before initialize".to_string(),
            ));
        }
        debug!(op = %def.op_type, backend = %def.backend, "Registered custom kernel");
        inner.kernels.register(def, factory);
        Ok(())
    }

    /// Transform, place, and plan the loaded graph. Initializing twice is a no-op.
    pub fn initialize(&self) -> Result<(), RuntimeError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.status {
            SessionStatus::Created => return Err(RuntimeError::NotLoaded),
            SessionStatus::Initialized => {
                debug!("Session already initialized");
                return Ok(());
            }
            SessionStatus::Loaded => {}
        }
        let started = Instant::now();
        let graph = inner.graph.clone().ok_or(RuntimeError::NotLoaded)?;
        let graph = prepare_graph(graph, &self.backends, &inner.kernels)?;
        let state = SessionState::build(graph, &self.backends, &inner.kernels, &self.options)?;
        inner.state = Some(Arc::new(state));
        inner.status = SessionStatus::Initialized;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Initialized session"
        );
        Ok(())
    }

    /// A copy of the graph: the placed and transformed one once initialized.
    pub fn graph(&self) -> Result<Graph, RuntimeError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = &inner.state {
            return Ok(state.graph().clone());
        }
        inner.graph.clone().ok_or(RuntimeError::NotLoaded)
    }

    pub fn input_names(&self) -> Result<Vec<String>, RuntimeError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let graph = inner.graph.as_ref().ok_or(RuntimeError::NotLoaded)?;
        Ok(graph.inputs().to_vec())
    }

    pub fn output_names(&self) -> Result<Vec<String>, RuntimeError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let graph = inner.graph.as_ref().ok_or(RuntimeError::NotLoaded)?;
        Ok(graph.outputs().to_vec())
    }

    /// Run the graph. An empty `output_names` fetches every graph output.
    pub fn run(
        &self,
        run_options: &RunOptions,
        feeds: HashMap<String, Value>,
        output_names: &[String],
    ) -> Result<HashMap<String, Value>, RuntimeError> {
        if self.status() == SessionStatus::Loaded && self.options.initialize_on_first_run {
            warn!("Session was not initialized; initializing on first run");
            self.initialize()?;
        }

        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let state = match (inner.status, &inner.state) {
            (SessionStatus::Created, _) => return Err(RuntimeError::NotLoaded),
            (SessionStatus::Initialized, Some(state)) => Arc::clone(state),
            _ => return Err(RuntimeError::NotInitialized),
        };

        let names: Vec<String> = if output_names.is_empty() {
            state.graph().outputs().to_vec()
        } else {
            output_names.to_vec()
        };
        let fetches = names
            .iter()
            .map(|name| {
                state.value_index(name).ok_or_else(|| {
                    RuntimeError::InvalidArgument(format!("unknown output '{}'", name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let feeds = feeds
            .into_iter()
            .map(|(name, value)| {
                let index = state.value_index(&name).ok_or_else(|| {
                    RuntimeError::InvalidArgument(format!("unknown feed '{}'", name))
                })?;
                Ok((index, value))
            })
            .collect::<Result<Vec<_>, RuntimeError>>()?;

        let executor: Box<dyn Executor> = if run_options.sequential {
            Box::new(SequentialExecutor)
        } else {
            Box::new(ParallelExecutor)
        };

        self.num_runs.fetch_add(1, Ordering::SeqCst);
        let _guard = RunGuard(&self.num_runs);
        let started = Instant::now();
        info!(tag = %run_options.tag, sequential = run_options.sequential, "Run started");

        let (tx, rx) = mpsc::sync_channel(1);
        let job_options = run_options.clone();
        self.pool.spawn(move || {
            let result = executor.execute(&state, &job_options, feeds, &fetches);
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        });

        let result = if run_options.timeout_ms > 0 {
            match rx.recv_timeout(Duration::from_millis(run_options.timeout_ms)) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(tag = %run_options.tag, timeout_ms = run_options.timeout_ms, "Run timed out");
                    Err(RuntimeError::Timeout(run_options.timeout_ms))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(aborted()),
            }
        } else {
            rx.recv().unwrap_or_else(|_| Err(aborted()))
        };
        drop(inner);

        let values = result?;
        info!(
            tag = %run_options.tag,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );
        Ok(names.into_iter().zip(values).collect())
    }
}

fn aborted() -> RuntimeError {
    RuntimeError::Backend("run aborted before producing a result".to_string())
}

/// Backend rewrites, node placement, then copy insertion at every device boundary.
fn prepare_graph(
    mut graph: Graph,
    backends: &[Arc<dyn ExecutionBackend>],
    kernels: &KernelRegistry,
) -> Result<Graph, RuntimeError> {
    for backend in backends {
        if let Some(transformer) = backend.graph_transformer() {
            let modified = transformer.apply(&mut graph)?;
            debug!(backend = backend.name(), transformer = transformer.name(), modified, "Applied graph transformer");
        }
    }
    graph.validate()?;

    let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
    for node in graph.nodes_mut() {
        if !node.backend.is_empty() {
            if !names.contains(&node.backend.as_str())
                || !kernels.has_kernel(&node.backend, &node.op_type)
            {
                return Err(RuntimeError::UnsupportedPlacement {
                    backend: node.backend.clone(),
                    op_type: node.op_type.clone(),
                });
            }
            continue;
        }
        let chosen = names
            .iter()
            .find(|b| kernels.has_kernel(b, &node.op_type))
            .ok_or_else(|| RuntimeError::KernelCreationFailure {
                op_type: node.op_type.clone(),
                backend: names.join(","),
            })?;
        node.backend = chosen.to_string();
    }

    let host = backends
        .iter()
        .find(|b| b.is_host())
        .map(|b| b.name().to_string())
        .ok_or_else(|| RuntimeError::Backend("no host backend".to_string()))?;
    for backend in backends.iter().filter(|b| !b.is_host()) {
        if !graph.nodes().any(|n| n.backend == backend.name()) {
            continue;
        }
        let transformer = MemcpyTransformer::new(backend.name(), &host, kernels);
        let modified = transformer.apply(&mut graph)?;
        debug!(backend = backend.name(), modified, "Inserted device copies");
    }
    graph.validate()?;
    Ok(graph)
}
