//! Execution backends and the process-wide backend registry.
//!
//! An [`ExecutionBackend`] owns a memory location, knows how to build the allocator for
//! it, contributes kernels to a [`KernelRegistry`], and may ship a graph transformer that
//! runs before placement. The host backend (`cpu`) is always available; `emulated` is a
//! device backend that keeps its data in host RAM under its own location.

pub mod cpu;
pub mod emulated;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::{info, warn};

use crate::error::RuntimeError;
use crate::graph::GraphTransformer;
use crate::kernel::KernelRegistry;
use crate::memory::{AllocatorInfo, AllocatorPtr, ArenaConfig};
use crate::tensor::{Tensor, TensorValue};

pub use cpu::CpuBackend;
pub use emulated::EmulatedBackend;

/// A compute target with its own kernels and memory.
pub trait ExecutionBackend: Send + Sync {
    /// Unique backend name, used for node placement.
    fn name(&self) -> &str;

    /// Whether this backend computes directly on host memory.
    fn is_host(&self) -> bool {
        false
    }

    /// Memory location of values produced on this backend.
    fn allocator_info(&self) -> &AllocatorInfo;

    /// Build the allocator serving [`allocator_info`](Self::allocator_info).
    fn create_allocator(&self, config: &ArenaConfig) -> Result<AllocatorPtr, RuntimeError>;

    /// Backend-specific rewrite run before placement.
    fn graph_transformer(&self) -> Option<Box<dyn GraphTransformer>> {
        None
    }

    fn register_kernels(&self, registry: &mut KernelRegistry);

    /// Copy a host tensor into this backend's memory.
    fn upload(&self, tensor: &Tensor, allocator: &AllocatorPtr) -> Result<TensorValue, RuntimeError> {
        let mut value = TensorValue::allocate(allocator, tensor.dtype(), tensor.shape().to_vec())?;
        value.data_mut()?.copy_from_slice(&tensor.to_bytes());
        Ok(value)
    }
}

pub type BackendFactory = fn() -> Arc<dyn ExecutionBackend>;

/// Backend factories by name.
pub struct BackendRegistry {
    factories: RwLock<BTreeMap<String, BackendFactory>>,
}

fn create_cpu() -> Arc<dyn ExecutionBackend> {
    Arc::new(CpuBackend::new())
}

fn create_emulated() -> Arc<dyn ExecutionBackend> {
    Arc::new(EmulatedBackend::new(0))
}

impl BackendRegistry {
    fn with_builtins() -> Self {
        let mut factories: BTreeMap<String, BackendFactory> = BTreeMap::new();
        factories.insert(cpu::CPU_BACKEND.to_string(), create_cpu as BackendFactory);
        factories.insert(
            emulated::EMULATED_BACKEND.to_string(),
            create_emulated as BackendFactory,
        );
        Self {
            factories: RwLock::new(factories),
        }
    }

    pub fn register(&self, name: &str, factory: BackendFactory) {
        info!(backend = name, "Registered backend");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn ExecutionBackend>> {
        let factory = *self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)?;
        Some(factory())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// The process-wide backend registry.
pub fn registry() -> &'static BackendRegistry {
    static REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();
    REGISTRY.get_or_init(BackendRegistry::with_builtins)
}

/// Resolve a backend by name.
pub fn resolve_backend(name: &str) -> Result<Arc<dyn ExecutionBackend>, RuntimeError> {
    registry().create(name).ok_or_else(|| {
        RuntimeError::Backend(format!(
            "Unknown backend '{}'. Options: {}",
            name,
            registry().names().join(", ")
        ))
    })
}

/// Resolve backends in preference order. Unknown names are skipped with a warning, and
/// the host backend is appended when missing.
pub fn select_backends(names: &[String]) -> Vec<Arc<dyn ExecutionBackend>> {
    let mut backends: Vec<Arc<dyn ExecutionBackend>> = Vec::new();
    for name in names {
        if backends.iter().any(|b| b.name() == name) {
            continue;
        }
        match resolve_backend(name) {
            Ok(backend) => backends.push(backend),
            Err(e) => warn!(backend = %name, error = %e, "Skipping unavailable backend"),
        }
    }
    if !backends.iter().any(|b| b.is_host()) {
        backends.push(Arc::new(CpuBackend::new()));
    }
    info!(
        backends = ?backends.iter().map(|b| b.name().to_string()).collect::<Vec<_>>(),
        "Selected backends"
    );
    backends
}
