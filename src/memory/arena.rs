//! Best-fit-with-coalescing arena.
//!
//! The arena obtains large regions from a device allocator and carves them into chunks.
//! Free chunks are kept in 21 bins by power-of-two size class starting at 256 bytes;
//! within a bin they are ordered by (size, address) so the first hit is the best fit in
//! that class. Freed chunks merge with free physical neighbours before going back into a
//! bin. One mutex serializes every call on an arena instance.

use std::collections::{BTreeSet, HashMap};
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::RuntimeError;

use super::{Allocator, AllocatorInfo, MemoryRegion};

pub const MIN_ALLOCATION_BITS: u32 = 8;
/// Every chunk size is a multiple of this, and no split leaves a smaller remainder.
pub const MIN_ALLOCATION_SIZE: usize = 1 << MIN_ALLOCATION_BITS;
pub const NUM_BINS: usize = 21;

/// Arena growth parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Size of the first region requested from the device.
    pub initial_chunk_bytes: usize,
    /// Upper bound for the doubling extension size.
    pub max_extension_bytes: usize,
    /// Total bytes the arena may ever hold.
    pub max_mem: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_chunk_bytes: 1 << 20,
            max_extension_bytes: 1 << 30,
            max_mem: usize::MAX,
        }
    }
}

/// Counters describing arena activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub num_allocs: usize,
    pub num_extensions: usize,
    pub bytes_in_use: usize,
    pub max_bytes_in_use: usize,
    pub total_region_bytes: usize,
    pub largest_alloc: usize,
}

type ChunkHandle = usize;

#[derive(Debug, Clone)]
struct Chunk {
    addr: usize,
    size: usize,
    requested: usize,
    in_use: bool,
    prev: Option<ChunkHandle>,
    next: Option<ChunkHandle>,
    region: usize,
}

/// Bin index for a chunk or request of `size` bytes.
pub fn bin_for(size: usize) -> usize {
    let v = (size >> MIN_ALLOCATION_BITS).max(1);
    let log2 = (usize::BITS - 1 - v.leading_zeros()) as usize;
    log2.min(NUM_BINS - 1)
}

fn round_up(size: usize) -> Option<usize> {
    let mask = MIN_ALLOCATION_SIZE - 1;
    size.checked_add(mask).map(|s| s & !mask)
}

struct ArenaInner {
    chunks: Vec<Option<Chunk>>,
    recycled: Vec<ChunkHandle>,
    bins: Vec<BTreeSet<(usize, usize, ChunkHandle)>>,
    chunk_by_addr: HashMap<usize, ChunkHandle>,
    regions: Vec<MemoryRegion>,
    next_extension: usize,
    stats: ArenaStats,
}

impl ArenaInner {
    fn chunk(&self, h: ChunkHandle) -> &Chunk {
        self.chunks[h].as_ref().expect("live chunk handle")
    }

    fn chunk_mut(&mut self, h: ChunkHandle) -> &mut Chunk {
        self.chunks[h].as_mut().expect("live chunk handle")
    }

    fn new_chunk(&mut self, chunk: Chunk) -> ChunkHandle {
        let addr = chunk.addr;
        let h = match self.recycled.pop() {
            Some(h) => {
                self.chunks[h] = Some(chunk);
                h
            }
            None => {
                self.chunks.push(Some(chunk));
                self.chunks.len() - 1
            }
        };
        self.chunk_by_addr.insert(addr, h);
        h
    }

    fn delete_chunk(&mut self, h: ChunkHandle) {
        if let Some(chunk) = self.chunks[h].take() {
            self.chunk_by_addr.remove(&chunk.addr);
            self.recycled.push(h);
        }
    }

    fn insert_free(&mut self, h: ChunkHandle) {
        let (size, addr) = {
            let c = self.chunk(h);
            (c.size, c.addr)
        };
        self.bins[bin_for(size)].insert((size, addr, h));
    }

    fn remove_free(&mut self, h: ChunkHandle) {
        let (size, addr) = {
            let c = self.chunk(h);
            (c.size, c.addr)
        };
        self.bins[bin_for(size)].remove(&(size, addr, h));
    }

    fn find_chunk(&self, rounded: usize) -> Option<ChunkHandle> {
        self.bins[bin_for(rounded)..]
            .iter()
            .find_map(|bin| bin.range((rounded, 0, 0)..).next().map(|&(_, _, h)| h))
    }

    /// Split `h` so that it holds exactly `rounded` bytes when the remainder can stand alone.
    fn split(&mut self, h: ChunkHandle, rounded: usize) {
        let (addr, size, next, region) = {
            let c = self.chunk(h);
            (c.addr, c.size, c.next, c.region)
        };
        let remainder = size - rounded;
        if remainder < MIN_ALLOCATION_SIZE {
            return;
        }
        let tail = self.new_chunk(Chunk {
            addr: addr + rounded,
            size: remainder,
            requested: 0,
            in_use: false,
            prev: Some(h),
            next,
            region,
        });
        if let Some(n) = next {
            self.chunk_mut(n).prev = Some(tail);
        }
        let c = self.chunk_mut(h);
        c.size = rounded;
        c.next = Some(tail);
        self.insert_free(tail);
    }

    /// Absorb free chunk `b` (the physical successor of `a`) into `a`.
    fn merge(&mut self, a: ChunkHandle, b: ChunkHandle) {
        let (b_size, b_next) = {
            let c = self.chunk(b);
            (c.size, c.next)
        };
        if let Some(n) = b_next {
            self.chunk_mut(n).prev = Some(a);
        }
        let c = self.chunk_mut(a);
        c.size += b_size;
        c.next = b_next;
        self.delete_chunk(b);
    }

    fn free_bytes(&self) -> usize {
        self.bins
            .iter()
            .flat_map(|bin| bin.iter().map(|&(size, _, _)| size))
            .sum()
    }
}

/// Sub-allocator over regions obtained from a device allocator.
pub struct Arena {
    device: Box<dyn Allocator>,
    info: AllocatorInfo,
    config: ArenaConfig,
    inner: Mutex<ArenaInner>,
}

impl Arena {
    pub fn new(device: Box<dyn Allocator>, config: ArenaConfig) -> Self {
        let info = device.info().clone();
        debug!(
            location = %info,
            initial = config.initial_chunk_bytes,
            max_mem = config.max_mem,
            "Created arena"
        );
        let inner = ArenaInner {
            chunks: Vec::new(),
            recycled: Vec::new(),
            bins: (0..NUM_BINS).map(|_| BTreeSet::new()).collect(),
            chunk_by_addr: HashMap::new(),
            regions: Vec::new(),
            next_extension: config.initial_chunk_bytes.max(MIN_ALLOCATION_SIZE),
            stats: ArenaStats::default(),
        };
        Self {
            device,
            info,
            config,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn out_of_memory(&self, requested: usize) -> RuntimeError {
        RuntimeError::OutOfMemory {
            requested,
            location: self.info.to_string(),
        }
    }

    /// Acquire a new region large enough for `rounded` bytes.
    fn extend(&self, inner: &mut ArenaInner, rounded: usize) -> Result<(), RuntimeError> {
        let available = self
            .config
            .max_mem
            .saturating_sub(inner.stats.total_region_bytes);
        if rounded > available {
            return Err(self.out_of_memory(rounded));
        }
        let bytes = inner.next_extension.max(rounded).min(available);
        let region = self.device.alloc(bytes)?;
        let base = region.addr();
        let index = inner.regions.len();
        inner.regions.push(region);
        let h = inner.new_chunk(Chunk {
            addr: base,
            size: region.size(),
            requested: 0,
            in_use: false,
            prev: None,
            next: None,
            region: index,
        });
        inner.insert_free(h);
        inner.stats.total_region_bytes += region.size();
        inner.stats.num_extensions += 1;
        inner.next_extension = inner
            .next_extension
            .saturating_mul(2)
            .min(self.config.max_extension_bytes.max(MIN_ALLOCATION_SIZE));
        debug!(
            location = %self.info,
            bytes = region.size(),
            total = inner.stats.total_region_bytes,
            "Extended arena"
        );
        Ok(())
    }

    pub fn stats(&self) -> ArenaStats {
        self.lock().stats.clone()
    }

    /// Total bytes sitting in free chunks.
    pub fn free_bytes(&self) -> usize {
        self.lock().free_bytes()
    }

    pub fn free_chunk_count(&self) -> usize {
        self.lock().bins.iter().map(|b| b.len()).sum()
    }

    pub fn region_count(&self) -> usize {
        self.lock().regions.len()
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }
}

impl Allocator for Arena {
    fn info(&self) -> &AllocatorInfo {
        &self.info
    }

    fn alloc(&self, size: usize) -> Result<MemoryRegion, RuntimeError> {
        if size == 0 {
            return Err(RuntimeError::InvalidArgument(
                "zero-byte allocation requested".to_string(),
            ));
        }
        let rounded = round_up(size).ok_or_else(|| self.out_of_memory(size))?;
        let mut inner = self.lock();
        let h = match inner.find_chunk(rounded) {
            Some(h) => h,
            None => {
                self.extend(&mut inner, rounded)?;
                inner
                    .find_chunk(rounded)
                    .ok_or_else(|| self.out_of_memory(size))?
            }
        };
        inner.remove_free(h);
        inner.split(h, rounded);

        let (addr, chunk_size, region) = {
            let c = inner.chunk_mut(h);
            c.in_use = true;
            c.requested = size;
            (c.addr, c.size, c.region)
        };
        let stats = &mut inner.stats;
        stats.num_allocs += 1;
        stats.bytes_in_use += chunk_size;
        stats.max_bytes_in_use = stats.max_bytes_in_use.max(stats.bytes_in_use);
        stats.largest_alloc = stats.largest_alloc.max(size);

        let base = inner.regions[region];
        let ptr = base
            .sub_region(addr - base.addr(), chunk_size)
            .map(|r| r.ptr())
            .unwrap_or_else(NonNull::dangling);
        trace!(location = %self.info, size, chunk = chunk_size, addr, "Arena alloc");
        Ok(MemoryRegion::new(ptr, chunk_size))
    }

    fn free(&self, region: MemoryRegion) {
        let mut inner = self.lock();
        let addr = region.addr();
        let h = match inner.chunk_by_addr.get(&addr) {
            Some(&h) if inner.chunk(h).in_use => h,
            _ => {
                warn!(location = %self.info, addr, "Ignoring free of unknown arena region");
                return;
            }
        };
        let size = {
            let c = inner.chunk_mut(h);
            c.in_use = false;
            c.requested = 0;
            c.size
        };
        inner.stats.bytes_in_use -= size;

        let mut merged = h;
        if let Some(n) = inner.chunk(merged).next {
            if !inner.chunk(n).in_use {
                inner.remove_free(n);
                inner.merge(merged, n);
            }
        }
        if let Some(p) = inner.chunk(merged).prev {
            if !inner.chunk(p).in_use {
                inner.remove_free(p);
                inner.merge(p, merged);
                merged = p;
            }
        }
        inner.insert_free(merged);
        trace!(location = %self.info, addr, size, "Arena free");
    }

    fn allows_arena(&self) -> bool {
        false
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.stats.bytes_in_use > 0 {
            warn!(
                location = %self.info,
                bytes = inner.stats.bytes_in_use,
                "Arena dropped with live allocations"
            );
        }
        for region in inner.regions.drain(..) {
            self.device.free(region);
        }
    }
}
