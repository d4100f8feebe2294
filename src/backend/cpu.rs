//! CPU execution backend.
//!
//! Kernels run on host memory in pure Rust. All numeric kernels operate on F32; Identity
//! forwards a buffer of any element type.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::RuntimeError;
use crate::graph::{GraphTransformer, IdentityElimination};
use crate::kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};
use crate::memory::{AllocatorInfo, AllocatorPtr, ArenaConfig, DeviceAllocatorRegistry};
use crate::tensor::ElementType;

use super::ExecutionBackend;

pub const CPU_BACKEND: &str = "cpu";

/// CPU execution backend. All operations run on the host CPU.
pub struct CpuBackend {
    info: AllocatorInfo,
}

impl CpuBackend {
    /// Create a new CPU backend.
    pub fn new() -> Self {
        debug!("Initialized CpuBackend");
        Self {
            info: AllocatorInfo::cpu(),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for CpuBackend {
    fn name(&self) -> &str {
        CPU_BACKEND
    }

    fn is_host(&self) -> bool {
        true
    }

    fn allocator_info(&self) -> &AllocatorInfo {
        &self.info
    }

    fn create_allocator(&self, config: &ArenaConfig) -> Result<AllocatorPtr, RuntimeError> {
        DeviceAllocatorRegistry::instance().create(&self.info, config)
    }

    fn graph_transformer(&self) -> Option<Box<dyn GraphTransformer>> {
        Some(Box::new(IdentityElimination))
    }

    fn register_kernels(&self, registry: &mut KernelRegistry) {
        register_numeric_kernels(registry, CPU_BACKEND);
        for op in ["Gelu", "Silu", "Tanh"] {
            registry.register(KernelDef::new(op, CPU_BACKEND), move |_| {
                Ok(Box::new(Unary::for_op(op)?))
            });
        }
        registry.register(KernelDef::new("Softmax", CPU_BACKEND), |_| {
            Ok(Box::new(Softmax))
        });
        registry.register(KernelDef::new("MatMul", CPU_BACKEND), |_| {
            Ok(Box::new(MatMul))
        });
    }
}

/// Kernels shared by every backend that keeps F32 data addressable from the host.
pub(crate) fn register_numeric_kernels(registry: &mut KernelRegistry, backend: &str) {
    for op in ["Add", "Mul"] {
        registry.register(KernelDef::new(op, backend), move |_| {
            Ok(Box::new(Binary::for_op(op)?))
        });
    }
    registry.register(KernelDef::new("Relu", backend), |_| {
        Ok(Box::new(Unary::for_op("Relu")?))
    });
    registry.register(KernelDef::new("Scale", backend), |info| {
        let factor = info.attr_float("factor").unwrap_or(1.0) as f32;
        Ok(Box::new(Scale { factor }))
    });
    registry.register(KernelDef::new("Identity", backend), |_| {
        Ok(Box::new(Identity))
    });
}

// ---------------------------------------------------------------------------
// Element-wise kernels
// ---------------------------------------------------------------------------

fn relu(x: f32) -> f32 {
    x.max(0.0)
}

// Exact GELU: 0.5 * x * (1.0 + erf(x / sqrt(2)))
fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2))
}

// SiLU: x * sigmoid(x) = x / (1 + exp(-x))
fn silu(x: f32) -> f32 {
    x * (1.0 / (1.0 + (-x).exp()))
}

fn tanh(x: f32) -> f32 {
    x.tanh()
}

pub(crate) struct Unary {
    name: &'static str,
    f: fn(f32) -> f32,
}

impl Unary {
    pub(crate) fn for_op(op: &str) -> Result<Self, RuntimeError> {
        let (name, f): (&'static str, fn(f32) -> f32) = match op {
            "Relu" => ("Relu", relu),
            "Gelu" => ("Gelu", gelu),
            "Silu" => ("Silu", silu),
            "Tanh" => ("Tanh", tanh),
            other => {
                return Err(RuntimeError::InvalidArgument(format!(
                    "no element-wise function for '{}'",
                    other
                )))
            }
        };
        Ok(Self { name, f })
    }
}

impl OpKernel for Unary {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        let x = ctx.input(0)?.clone();
        let data = x.as_f32()?;
        trace!(op = self.name, n_elements = data.len(), "CPU unary");
        let out = ctx.output(0, ElementType::F32, x.shape())?.as_f32_mut()?;
        for (o, &v) in out.iter_mut().zip(data) {
            *o = (self.f)(v);
        }
        Ok(())
    }
}

pub(crate) struct Binary {
    name: &'static str,
    f: fn(f32, f32) -> f32,
}

impl Binary {
    pub(crate) fn for_op(op: &str) -> Result<Self, RuntimeError> {
        let (name, f): (&'static str, fn(f32, f32) -> f32) = match op {
            "Add" => ("Add", |a, b| a + b),
            "Mul" => ("Mul", |a, b| a * b),
            other => {
                return Err(RuntimeError::InvalidArgument(format!(
                    "no binary function for '{}'",
                    other
                )))
            }
        };
        Ok(Self { name, f })
    }
}

impl OpKernel for Binary {
    /// Same-shape element-wise, or `[..., N] op [N]` broadcast over rows.
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        let a = ctx.input(0)?.clone();
        let b = ctx.input(1)?.clone();
        let a_data = a.as_f32()?;
        let b_data = b.as_f32()?;
        let a_shape = a.shape();
        let b_shape = b.shape();

        let broadcast = a_shape != b_shape;
        if broadcast {
            let row = a_shape.last().copied().unwrap_or(1);
            if b_shape.len() != 1 || b_shape[0] != row || row == 0 {
                return Err(RuntimeError::InvalidArgument(format!(
                    "{}: unsupported shapes {:?} and {:?}",
                    self.name, a_shape, b_shape
                )));
            }
        }
        trace!(op = self.name, shape = ?a_shape, broadcast, "CPU binary");

        let out = ctx.output(0, ElementType::F32, a_shape)?.as_f32_mut()?;
        if broadcast {
            for (out_row, a_row) in out.chunks_mut(b_data.len()).zip(a_data.chunks(b_data.len())) {
                for ((o, &x), &y) in out_row.iter_mut().zip(a_row).zip(b_data) {
                    *o = (self.f)(x, y);
                }
            }
        } else {
            for ((o, &x), &y) in out.iter_mut().zip(a_data).zip(b_data) {
                *o = (self.f)(x, y);
            }
        }
        Ok(())
    }
}

pub(crate) struct Scale {
    factor: f32,
}

impl OpKernel for Scale {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        let x = ctx.input(0)?.clone();
        let data = x.as_f32()?;
        trace!(n_elements = data.len(), factor = self.factor, "CPU scale");
        let out = ctx.output(0, ElementType::F32, x.shape())?.as_f32_mut()?;
        for (o, &v) in out.iter_mut().zip(data) {
            *o = v * self.factor;
        }
        Ok(())
    }
}

/// Copies its input to its output, for any element type.
/// Forwards its input buffer as the output, without copying.
pub(crate) struct Identity;

impl OpKernel for Identity {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        let x = ctx.input(0)?.clone();
        ctx.alias_output(0, x.dtype(), x.shape(), Arc::clone(x.buffer()))
    }
}

// ---------------------------------------------------------------------------
// Row-wise and matrix kernels
// ---------------------------------------------------------------------------

/// Per-row softmax over the last dimension.
struct Softmax;

impl OpKernel for Softmax {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        let x = ctx.input(0)?.clone();
        let data = x.as_f32()?;
        let shape = x.shape();
        let Some(&last_dim) = shape.last() else {
            return Err(RuntimeError::InvalidArgument(
                "softmax: tensor must be at least 1D".to_string(),
            ));
        };
        let n_rows: usize = shape[..shape.len() - 1].iter().product::<usize>().max(1);
        trace!(n_rows, last_dim, "CPU softmax");

        let out = ctx.output(0, ElementType::F32, shape)?.as_f32_mut()?;
        if last_dim == 0 {
            return Ok(());
        }
        for (row_out, row_data) in out.chunks_mut(last_dim).zip(data.chunks(last_dim)) {
            // Numerical stability: subtract max
            let max_val = row_data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for (o, &v) in row_out.iter_mut().zip(row_data) {
                *o = (v - max_val).exp();
                sum += *o;
            }
            if sum > 0.0 {
                for o in row_out.iter_mut() {
                    *o /= sum;
                }
            }
        }
        Ok(())
    }
}

/// [M, K] x [K, N] -> [M, N]
struct MatMul;

impl OpKernel for MatMul {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        let a = ctx.input(0)?.clone();
        let b = ctx.input(1)?.clone();
        let (a_shape, b_shape) = (a.shape(), b.shape());
        if a_shape.len() != 2 || b_shape.len() != 2 {
            return Err(RuntimeError::InvalidArgument(format!(
                "matmul: inputs must be 2D, got {:?} and {:?}",
                a_shape, b_shape
            )));
        }
        let (m, k, n) = (a_shape[0], a_shape[1], b_shape[1]);
        if k != b_shape[0] {
            return Err(RuntimeError::ShapeMismatch {
                expected: vec![k, n],
                actual: b_shape.to_vec(),
            });
        }
        trace!(m, k, n, "CPU matmul");

        let a_data = a.as_f32()?;
        let b_data = b.as_f32()?;
        let out = ctx.output(0, ElementType::F32, &[m, n])?.as_f32_mut()?;
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for p in 0..k {
                    sum += a_data[i * k + p] * b_data[p * n + j];
                }
                out[i * n + j] = sum;
            }
        }
        Ok(())
    }
}
