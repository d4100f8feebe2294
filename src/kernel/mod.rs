//! Kernel interface and the (backend, operator) → factory registry.

mod context;

pub use context::{KernelContext, OutputAllocator};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::error::RuntimeError;
use crate::graph::Node;
use crate::memory::AllocatorInfo;

/// Where a kernel expects one of its inputs or outputs to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemType {
    /// The kernel's own backend memory.
    #[default]
    Default,
    /// Host memory, even though the kernel runs on a device backend.
    CpuInput,
    CpuOutput,
}

/// Static description of a kernel: which operator on which backend, and memory pins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDef {
    pub op_type: String,
    pub backend: String,
    input_mem_types: BTreeMap<usize, MemType>,
    output_mem_types: BTreeMap<usize, MemType>,
}

impl KernelDef {
    pub fn new(op_type: &str, backend: &str) -> Self {
        Self {
            op_type: op_type.to_string(),
            backend: backend.to_string(),
            input_mem_types: BTreeMap::new(),
            output_mem_types: BTreeMap::new(),
        }
    }

    /// Pin input `index` to host memory.
    pub fn input_on_host(mut self, index: usize) -> Self {
        self.input_mem_types.insert(index, MemType::CpuInput);
        self
    }

    /// Pin output `index` to host memory.
    pub fn output_on_host(mut self, index: usize) -> Self {
        self.output_mem_types.insert(index, MemType::CpuOutput);
        self
    }

    pub fn input_memory_type(&self, index: usize) -> MemType {
        self.input_mem_types.get(&index).copied().unwrap_or_default()
    }

    pub fn output_memory_type(&self, index: usize) -> MemType {
        self.output_mem_types.get(&index).copied().unwrap_or_default()
    }

    pub fn is_input_on_host(&self, index: usize) -> bool {
        self.input_memory_type(index) == MemType::CpuInput
    }

    pub fn is_output_on_host(&self, index: usize) -> bool {
        self.output_memory_type(index) == MemType::CpuOutput
    }
}

/// What a factory sees when building a kernel for a node.
pub struct KernelInfo<'a> {
    node: &'a Node,
    allocator_info: &'a AllocatorInfo,
}

impl<'a> KernelInfo<'a> {
    pub fn new(node: &'a Node, allocator_info: &'a AllocatorInfo) -> Self {
        Self {
            node,
            allocator_info,
        }
    }

    pub fn node(&self) -> &'a Node {
        self.node
    }

    /// Memory location of the kernel's backend.
    pub fn allocator_info(&self) -> &'a AllocatorInfo {
        self.allocator_info
    }

    pub fn attr_float(&self, name: &str) -> Option<f64> {
        self.node.attr_float(name)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        self.node.attr_int(name)
    }
}

/// An operator implementation bound to one node.
pub trait OpKernel: Send + Sync {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError>;
}

pub type KernelFactory =
    Arc<dyn Fn(&KernelInfo<'_>) -> Result<Box<dyn OpKernel>, RuntimeError> + Send + Sync>;

#[derive(Clone)]
pub struct KernelCreateInfo {
    pub def: KernelDef,
    pub factory: KernelFactory,
}

/// Kernel factories keyed by (backend, operator).
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<(String, String), KernelCreateInfo>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later registration for the same key replaces the earlier one.
    pub fn register<F>(&mut self, def: KernelDef, factory: F)
    where
        F: Fn(&KernelInfo<'_>) -> Result<Box<dyn OpKernel>, RuntimeError> + Send + Sync + 'static,
    {
        debug!(backend = %def.backend, op = %def.op_type, "Registered kernel");
        let key = (def.backend.clone(), def.op_type.clone());
        self.kernels.insert(
            key,
            KernelCreateInfo {
                def,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn lookup(&self, backend: &str, op_type: &str) -> Option<&KernelCreateInfo> {
        self.kernels
            .get(&(backend.to_string(), op_type.to_string()))
    }

    pub fn has_kernel(&self, backend: &str, op_type: &str) -> bool {
        self.lookup(backend, op_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Build the kernel for a placed node.
    pub fn create_kernel(
        &self,
        node: &Node,
        allocator_info: &AllocatorInfo,
    ) -> Result<Box<dyn OpKernel>, RuntimeError> {
        let info = self.lookup(&node.backend, &node.op_type).ok_or_else(|| {
            RuntimeError::KernelCreationFailure {
                op_type: node.op_type.clone(),
                backend: node.backend.clone(),
            }
        })?;
        (info.factory)(&KernelInfo::new(node, allocator_info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    struct Nop;

    impl OpKernel for Nop {
        fn compute(&self, _ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    #[test]
    fn test_kernel_def_pins() {
        let def = KernelDef::new("MemcpyFromHost", "dev").input_on_host(0);
        assert!(def.is_input_on_host(0));
        assert!(!def.is_input_on_host(1));
        assert_eq!(def.output_memory_type(0), MemType::Default);
    }

    #[test]
    fn test_registry_lookup_and_create() {
        let mut registry = KernelRegistry::new();
        registry.register(KernelDef::new("Nop", "cpu"), |_| Ok(Box::new(Nop)));
        assert!(registry.has_kernel("cpu", "Nop"));
        assert!(!registry.has_kernel("dev", "Nop"));

        let mut g = Graph::new("g");
        let i = g.add_node("n", "Nop", &[], &[]);
        let mut node = g.node(i).unwrap().clone();
        node.backend = "cpu".into();
        assert!(registry.create_kernel(&node, &AllocatorInfo::cpu()).is_ok());

        node.op_type = "Missing".into();
        let err = registry
            .create_kernel(&node, &AllocatorInfo::cpu())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RuntimeError::KernelCreationFailure { ref op_type, .. } if op_type == "Missing"
        ));
    }
}
