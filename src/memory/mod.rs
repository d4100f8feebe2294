//! Allocator abstraction, the host allocator, and reference-counted buffers.
//!
//! Every byte a graph run touches comes from an [`Allocator`] identified by an
//! [`AllocatorInfo`] (its memory location). Device allocators are usually wrapped in an
//! [`Arena`](arena::Arena) by [`registry::create_allocator`].

pub mod arena;
pub mod registry;

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::RuntimeError;

pub use arena::{Arena, ArenaConfig, ArenaStats};
pub use registry::{create_allocator, DeviceAllocatorRegistry};

/// Alignment of every region handed out by the allocators in this crate.
pub const ALIGNMENT: usize = 64;

/// Identifies a memory location: an allocator name plus device ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocatorInfo {
    pub name: String,
    pub device_id: u32,
}

pub const CPU: &str = "Cpu";

impl AllocatorInfo {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    /// The host memory location.
    pub fn cpu() -> Self {
        Self::new(CPU, 0)
    }

    pub fn is_cpu(&self) -> bool {
        self.name == CPU
    }
}

impl std::fmt::Display for AllocatorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.device_id)
    }
}

/// A contiguous byte range handed out by an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// Regions are plain address ranges; ownership is tracked by the allocator that issued them.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    pub fn new(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sub-range `[offset, offset + size)` of this region.
    pub fn sub_region(&self, offset: usize, size: usize) -> Option<MemoryRegion> {
        let end = offset.checked_add(size)?;
        if end > self.size {
            return None;
        }
        // SAFETY: offset is within the region, so the result stays inside the same object.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        Some(MemoryRegion { ptr, size })
    }
}

/// Device-level allocator.
pub trait Allocator: Send + Sync {
    /// Memory location this allocator serves.
    fn info(&self) -> &AllocatorInfo;

    /// Allocate at least `size` bytes, aligned to [`ALIGNMENT`].
    fn alloc(&self, size: usize) -> Result<MemoryRegion, RuntimeError>;

    /// Return a region previously obtained from `alloc`.
    fn free(&self, region: MemoryRegion);

    /// Whether [`registry::create_allocator`] may put an arena in front of this allocator.
    fn allows_arena(&self) -> bool {
        true
    }
}

pub type AllocatorPtr = Arc<dyn Allocator>;

impl<A: Allocator + ?Sized> Allocator for Arc<A> {
    fn info(&self) -> &AllocatorInfo {
        (**self).info()
    }

    fn alloc(&self, size: usize) -> Result<MemoryRegion, RuntimeError> {
        (**self).alloc(size)
    }

    fn free(&self, region: MemoryRegion) {
        (**self).free(region)
    }

    fn allows_arena(&self) -> bool {
        (**self).allows_arena()
    }
}

/// Host heap allocator with an optional byte capacity.
pub struct CpuAllocator {
    info: AllocatorInfo,
    capacity: usize,
    in_use: AtomicUsize,
    num_allocs: AtomicUsize,
    allows_arena: bool,
}

impl CpuAllocator {
    pub fn new() -> Self {
        Self::with_info(AllocatorInfo::cpu())
    }

    /// Host memory reported under a different location name. Used by backends that keep
    /// their data in host RAM but must not share buffers with the host backend.
    pub fn with_info(info: AllocatorInfo) -> Self {
        Self {
            info,
            capacity: usize::MAX,
            in_use: AtomicUsize::new(0),
            num_allocs: AtomicUsize::new(0),
            allows_arena: true,
        }
    }

    /// Fail with `OutOfMemory` once more than `capacity` bytes are outstanding.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn without_arena(mut self) -> Self {
        self.allows_arena = false;
        self
    }

    /// Bytes currently handed out.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Number of successful `alloc` calls so far.
    pub fn num_allocs(&self) -> usize {
        self.num_allocs.load(Ordering::Relaxed)
    }

    fn layout(&self, size: usize) -> Result<Layout, RuntimeError> {
        Layout::from_size_align(size, ALIGNMENT)
            .map_err(|e| RuntimeError::InvalidArgument(format!("bad allocation size {}: {}", size, e)))
    }

    fn out_of_memory(&self, size: usize) -> RuntimeError {
        RuntimeError::OutOfMemory {
            requested: size,
            location: self.info.to_string(),
        }
    }
}

impl Default for CpuAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for CpuAllocator {
    fn info(&self) -> &AllocatorInfo {
        &self.info
    }

    fn alloc(&self, size: usize) -> Result<MemoryRegion, RuntimeError> {
        if size == 0 {
            return Err(RuntimeError::InvalidArgument(
                "zero-byte allocation requested".to_string(),
            ));
        }
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.capacity)
            });
        if reserved.is_err() {
            return Err(self.out_of_memory(size));
        }
        let layout = match self.layout(size) {
            Ok(layout) => layout,
            Err(e) => {
                self.in_use.fetch_sub(size, Ordering::AcqRel);
                return Err(e);
            }
        };
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.in_use.fetch_sub(size, Ordering::AcqRel);
            return Err(self.out_of_memory(size));
        };
        self.num_allocs.fetch_add(1, Ordering::Relaxed);
        trace!(location = %self.info, size, "Host allocation");
        Ok(MemoryRegion::new(ptr, size))
    }

    fn free(&self, region: MemoryRegion) {
        if let Ok(layout) = self.layout(region.size()) {
            // SAFETY: the region was produced by `alloc` with the same layout.
            unsafe { alloc::dealloc(region.ptr().as_ptr(), layout) };
            self.in_use.fetch_sub(region.size(), Ordering::AcqRel);
        }
    }

    fn allows_arena(&self) -> bool {
        self.allows_arena
    }
}

enum BufferOwner {
    /// Region owned by the buffer; returned to the allocator on drop.
    Allocator(AllocatorPtr),
    /// Sub-range of a larger block that must outlive this buffer.
    Block(#[allow(dead_code)] Arc<Buffer>),
    /// Zero-length buffer with no backing memory.
    Empty,
}

/// A byte buffer in some memory location.
pub struct Buffer {
    region: MemoryRegion,
    location: AllocatorInfo,
    owner: BufferOwner,
}

impl Buffer {
    /// Allocate `size` bytes from `allocator`. Zero sizes need no memory.
    pub fn allocate(allocator: &AllocatorPtr, size: usize) -> Result<Self, RuntimeError> {
        if size == 0 {
            return Ok(Self::empty(allocator.info().clone()));
        }
        let region = allocator.alloc(size)?;
        debug_assert!(region.size() >= size);
        Ok(Self {
            region: MemoryRegion::new(region.ptr(), region.size()),
            location: allocator.info().clone(),
            owner: BufferOwner::Allocator(Arc::clone(allocator)),
        })
    }

    pub fn empty(location: AllocatorInfo) -> Self {
        Self {
            region: MemoryRegion::new(NonNull::dangling(), 0),
            location,
            owner: BufferOwner::Empty,
        }
    }

    /// A view of `[offset, offset + size)` inside `block` that keeps the block alive.
    pub fn slice_of(block: &Arc<Buffer>, offset: usize, size: usize) -> Result<Self, RuntimeError> {
        if size == 0 {
            return Ok(Self::empty(block.location.clone()));
        }
        let region = block.region.sub_region(offset, size).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "slice [{}, +{}) exceeds block of {} bytes",
                offset,
                size,
                block.len()
            ))
        })?;
        Ok(Self {
            region,
            location: block.location.clone(),
            owner: BufferOwner::Block(Arc::clone(block)),
        })
    }

    pub fn len(&self) -> usize {
        self.region.size()
    }

    pub fn is_empty(&self) -> bool {
        self.region.size() == 0
    }

    pub fn location(&self) -> &AllocatorInfo {
        &self.location
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.region.ptr().as_ptr()
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.is_empty() {
            return &[];
        }
        // SAFETY: the region is live for as long as `self` and spans `len` bytes.
        unsafe { std::slice::from_raw_parts(self.region.ptr().as_ptr(), self.len()) }
    }

    /// Block slices never overlap while both are alive, so `&mut self` is exclusive.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.is_empty() {
            return &mut [];
        }
        // SAFETY: as for `as_slice`, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.region.ptr().as_ptr(), self.len()) }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owner = match &self.owner {
            BufferOwner::Allocator(_) => "owned",
            BufferOwner::Block(_) => "block",
            BufferOwner::Empty => "empty",
        };
        f.debug_struct("Buffer")
            .field("location", &self.location.to_string())
            .field("len", &self.len())
            .field("owner", &owner)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let BufferOwner::Allocator(allocator) = &self.owner {
            allocator.free(self.region);
        }
    }
}
