//! A device backend that lives in host RAM under its own memory location.
//!
//! Every kernel checks that its inputs are in emulated memory (or on the host, for pinned
//! copy inputs), so a graph that hands a host buffer straight to an emulated kernel fails
//! the same way it would on real accelerator memory.

use tracing::{debug, trace};

use crate::error::RuntimeError;
use crate::graph::memcpy::{MEMCPY_FROM_HOST, MEMCPY_TO_HOST};
use crate::kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};
use crate::memory::registry::{create_allocator, DeviceAllocatorRegistrationInfo};
use crate::memory::{AllocatorInfo, AllocatorPtr, ArenaConfig, CpuAllocator};

use super::cpu::register_numeric_kernels;
use super::ExecutionBackend;

pub const EMULATED_BACKEND: &str = "emulated";
pub const EMULATED_MEMORY: &str = "Emulated";

pub struct EmulatedBackend {
    info: AllocatorInfo,
    max_mem: usize,
}

impl EmulatedBackend {
    pub fn new(device_id: u32) -> Self {
        debug!(device_id, "Initialized EmulatedBackend");
        Self {
            info: AllocatorInfo::new(EMULATED_MEMORY, device_id),
            max_mem: usize::MAX,
        }
    }

    /// Cap the device memory this backend's arena may acquire.
    pub fn with_max_mem(mut self, max_mem: usize) -> Self {
        self.max_mem = max_mem;
        self
    }
}

fn emulated_device(device_id: u32) -> Box<dyn crate::memory::Allocator> {
    Box::new(CpuAllocator::with_info(AllocatorInfo::new(
        EMULATED_MEMORY,
        device_id,
    )))
}

impl ExecutionBackend for EmulatedBackend {
    fn name(&self) -> &str {
        EMULATED_BACKEND
    }

    fn allocator_info(&self) -> &AllocatorInfo {
        &self.info
    }

    fn create_allocator(&self, config: &ArenaConfig) -> Result<AllocatorPtr, RuntimeError> {
        let registration = DeviceAllocatorRegistrationInfo {
            factory: emulated_device,
            max_mem: self.max_mem,
        };
        Ok(create_allocator(&registration, self.info.device_id, config))
    }

    fn register_kernels(&self, registry: &mut KernelRegistry) {
        let mut numeric = KernelRegistry::new();
        register_numeric_kernels(&mut numeric, EMULATED_BACKEND);
        for op in ["Add", "Mul", "Relu", "Scale", "Identity"] {
            let Some(inner) = numeric.lookup(EMULATED_BACKEND, op).cloned() else {
                continue;
            };
            registry.register(inner.def.clone(), move |info| {
                Ok(Box::new(OnDevice {
                    inner: (inner.factory)(info)?,
                    location: info.allocator_info().clone(),
                }))
            });
        }
        registry.register(
            KernelDef::new(MEMCPY_FROM_HOST, EMULATED_BACKEND).input_on_host(0),
            |info| {
                Ok(Box::new(Memcpy {
                    source: AllocatorInfo::cpu(),
                    target: info.allocator_info().clone(),
                }))
            },
        );
        registry.register(
            KernelDef::new(MEMCPY_TO_HOST, EMULATED_BACKEND).output_on_host(0),
            |info| {
                Ok(Box::new(Memcpy {
                    source: info.allocator_info().clone(),
                    target: AllocatorInfo::cpu(),
                }))
            },
        );
    }
}

fn check_location(
    ctx: &KernelContext<'_>,
    index: usize,
    expected: &AllocatorInfo,
) -> Result<(), RuntimeError> {
    if let Some(input) = ctx.optional_input(index) {
        if input.location() != expected {
            return Err(RuntimeError::Backend(format!(
                "node '{}' input {} is in {} memory, expected {}",
                ctx.node().name,
                index,
                input.location(),
                expected
            )));
        }
    }
    Ok(())
}

/// Runs a host-math kernel after checking that every input is in device memory.
struct OnDevice {
    inner: Box<dyn OpKernel>,
    location: AllocatorInfo,
}

impl OpKernel for OnDevice {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        for i in 0..ctx.input_count() {
            check_location(ctx, i, &self.location)?;
        }
        self.inner.compute(ctx)
    }
}

struct Memcpy {
    source: AllocatorInfo,
    target: AllocatorInfo,
}

impl OpKernel for Memcpy {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        check_location(ctx, 0, &self.source)?;
        let x = ctx.input(0)?.clone();
        trace!(from = %self.source, to = %self.target, bytes = x.byte_size(), "Emulated memcpy");
        let out = ctx.output(0, x.dtype(), x.shape())?;
        if out.location() != &self.target {
            return Err(RuntimeError::Backend(format!(
                "copy output was placed in {} memory, expected {}",
                out.location(),
                self.target
            )));
        }
        out.data_mut()?.copy_from_slice(x.data());
        Ok(())
    }
}
