//! Memory patterns: per-location offset tables recorded from one run and replayed on
//! later runs with identical feed shapes.
//!
//! A pattern lays every traced value out inside one block per location. Values whose
//! lifetimes do not overlap may share bytes; replay is only sound when the allocate and
//! free order matches the recorded run, which sequential execution guarantees.

use std::collections::{BTreeMap, HashMap};

use crate::memory::{AllocatorInfo, ALIGNMENT};

use super::plan::ValueIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationPattern {
    pub blocks: HashMap<ValueIndex, MemoryBlock>,
    pub peak_size: usize,
}

/// Offsets for every traced value, grouped by memory location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPattern {
    pub locations: BTreeMap<AllocatorInfo, LocationPattern>,
}

impl MemoryPattern {
    pub fn block(&self, location: &AllocatorInfo, value: ValueIndex) -> Option<MemoryBlock> {
        self.locations.get(location)?.blocks.get(&value).copied()
    }

    pub fn peak_size(&self, location: &AllocatorInfo) -> usize {
        self.locations.get(location).map_or(0, |p| p.peak_size)
    }

    pub fn num_blocks(&self) -> usize {
        self.locations.values().map(|p| p.blocks.len()).sum()
    }
}

fn align(size: usize) -> usize {
    (size + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT
}

#[derive(Debug, Default)]
struct LocationPlanner {
    /// offset -> (reserved size, value) for blocks currently live.
    live: BTreeMap<usize, (usize, ValueIndex)>,
    pattern: LocationPattern,
}

impl LocationPlanner {
    /// Best-fit gap between live blocks, or the end of the highest live block.
    fn place(&self, reserved: usize) -> usize {
        let mut best: Option<(usize, usize)> = None; // (gap size, offset)
        let mut cursor = 0usize;
        for (&offset, &(size, _)) in &self.live {
            let gap = offset - cursor;
            if gap >= reserved && best.map_or(true, |(b, _)| gap < b) {
                best = Some((gap, cursor));
            }
            cursor = offset + size;
        }
        best.map_or(cursor, |(_, offset)| offset)
    }
}

/// Traces allocate/free events and produces a [`MemoryPattern`].
#[derive(Debug, Default)]
pub struct PatternPlanner {
    locations: BTreeMap<AllocatorInfo, LocationPlanner>,
}

impl PatternPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace_allocation(&mut self, location: &AllocatorInfo, value: ValueIndex, size: usize) {
        let planner = self.locations.entry(location.clone()).or_default();
        let reserved = align(size.max(1));
        let offset = planner.place(reserved);
        planner.live.insert(offset, (reserved, value));
        planner
            .pattern
            .blocks
            .insert(value, MemoryBlock { offset, size });
        planner.pattern.peak_size = planner.pattern.peak_size.max(offset + reserved);
    }

    pub fn trace_free(&mut self, location: &AllocatorInfo, value: ValueIndex) {
        if let Some(planner) = self.locations.get_mut(location) {
            if let Some(block) = planner.pattern.blocks.get(&value) {
                if planner.live.get(&block.offset).map(|&(_, v)| v) == Some(value) {
                    planner.live.remove(&block.offset);
                }
            }
        }
    }

    pub fn generate(&self) -> MemoryPattern {
        MemoryPattern {
            locations: self
                .locations
                .iter()
                .map(|(info, planner)| (info.clone(), planner.pattern.clone()))
                .collect(),
        }
    }
}
