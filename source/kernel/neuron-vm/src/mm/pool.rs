// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual range pools (dynamic first-fit heap and static bitmap pool)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: DynamicPool{allocate,free,shrink,contains}, StaticPool{allocate,free,shrink,contains}
//! INVARIANTS: Handed-out ranges never overlap; free/shrink accept any address inside a range

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::Region;
use crate::types::VirtAddr;

const WORD_BITS: usize = u64::BITS as usize;

fn round_up(length: usize, granularity: usize) -> Option<usize> {
    length.checked_add(granularity - 1).map(|v| v & !(granularity - 1))
}

/// First-fit range allocator over a region, used for Context heaps and thread-local ranges.
#[derive(Debug)]
pub struct DynamicPool {
    region: Region,
    granularity: usize,
    free: BTreeMap<VirtAddr, usize>,
    used: BTreeMap<VirtAddr, usize>,
}

impl DynamicPool {
    /// Builds a pool spanning `region`; `granularity` must be a power of two.
    pub fn new(region: Region, granularity: usize) -> Self {
        debug_assert!(granularity.is_power_of_two());
        let mut free = BTreeMap::new();
        if region.length != 0 {
            free.insert(region.base, region.length);
        }
        Self { region, granularity, free, used: BTreeMap::new() }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// True when `address` lies inside the pool's region, allocated or not.
    pub fn contains(&self, address: VirtAddr) -> bool {
        self.region.contains(address)
    }

    /// Allocates `length` bytes rounded up to the granularity; lowest fitting address wins.
    pub fn allocate(&mut self, length: usize) -> Option<VirtAddr> {
        if length == 0 {
            return None;
        }
        let length = round_up(length, self.granularity)?;
        let (&start, &size) = self.free.iter().find(|(_, size)| **size >= length)?;
        self.free.remove(&start);
        if size > length {
            self.free.insert(start + length, size - length);
        }
        self.used.insert(start, length);
        Some(start)
    }

    /// Frees the range containing `address`; returns its length.
    pub fn free(&mut self, address: VirtAddr) -> Option<usize> {
        let (start, length) = self.used_range(address)?;
        self.used.remove(&start);
        self.insert_free(start, length);
        Some(length)
    }

    /// Shrinks the range containing `address` to `keep` bytes; zero frees it entirely.
    pub fn shrink(&mut self, address: VirtAddr, keep: usize) -> bool {
        let Some((start, length)) = self.used_range(address) else {
            return false;
        };
        let Some(keep) = round_up(keep, self.granularity) else {
            return false;
        };
        if keep == 0 {
            return self.free(start).is_some();
        }
        if keep >= length {
            return true;
        }
        self.used.insert(start, keep);
        self.insert_free(start + keep, length - keep);
        true
    }

    /// Returns `(start, length)` of the allocated range containing `address`.
    pub fn used_range(&self, address: VirtAddr) -> Option<(VirtAddr, usize)> {
        let (&start, &length) = self.used.range(..=address).next_back()?;
        (address < start + length).then_some((start, length))
    }

    /// Releases every allocated range.
    pub fn clear(&mut self) {
        self.used.clear();
        self.free.clear();
        if self.region.length != 0 {
            self.free.insert(self.region.base, self.region.length);
        }
    }

    pub fn allocated_ranges(&self) -> usize {
        self.used.len()
    }

    fn insert_free(&mut self, mut start: VirtAddr, mut length: usize) {
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                length += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(start + length)) {
            self.free.remove(&(start + length));
            length += next_len;
        }
        self.free.insert(start, length);
    }
}

/// Bitmap pool of fixed-size blocks for the machine-wide global access range.
#[derive(Debug)]
pub struct StaticPool {
    region: Region,
    block: usize,
    bitmap: Vec<u64>,
    /// Start block -> block count of each allocation.
    runs: BTreeMap<usize, usize>,
}

impl StaticPool {
    pub fn new(region: Region, block: usize) -> Self {
        debug_assert!(block.is_power_of_two());
        let blocks = region.length / block;
        let words = blocks.div_ceil(WORD_BITS);
        let mut bitmap = vec![0u64; words];
        // Mark the tail of the last word as used so it is never handed out.
        for index in blocks..words * WORD_BITS {
            bitmap[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
        Self { region, block, bitmap, runs: BTreeMap::new() }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn contains(&self, address: VirtAddr) -> bool {
        self.region.contains(address)
    }

    /// Allocates the lowest run of blocks covering `length`.
    pub fn allocate(&mut self, length: usize) -> Option<VirtAddr> {
        if length == 0 {
            return None;
        }
        let needed = length.div_ceil(self.block);
        let total = self.bitmap.len() * WORD_BITS;
        let mut start = 0;
        while start + needed <= total {
            match (start..start + needed).find(|&index| self.is_set(index)) {
                Some(busy) => start = busy + 1,
                None => {
                    for index in start..start + needed {
                        self.set(index, true);
                    }
                    self.runs.insert(start, needed);
                    return Some(self.region.base + start * self.block);
                }
            }
        }
        None
    }

    /// Frees the run containing `address`; returns its length in bytes.
    pub fn free(&mut self, address: VirtAddr) -> Option<usize> {
        let (start, count) = self.run_containing(address)?;
        self.runs.remove(&start);
        for index in start..start + count {
            self.set(index, false);
        }
        Some(count * self.block)
    }

    /// Shrinks the run containing `address` to `keep` bytes; zero frees it entirely.
    pub fn shrink(&mut self, address: VirtAddr, keep: usize) -> bool {
        let Some((start, count)) = self.run_containing(address) else {
            return false;
        };
        let keep_blocks = keep.div_ceil(self.block);
        if keep_blocks == 0 {
            return self.free(address).is_some();
        }
        if keep_blocks >= count {
            return true;
        }
        for index in start + keep_blocks..start + count {
            self.set(index, false);
        }
        self.runs.insert(start, keep_blocks);
        true
    }

    /// Returns `(start address, length)` of the run containing `address`.
    pub fn used_range(&self, address: VirtAddr) -> Option<(VirtAddr, usize)> {
        self.run_containing(address)
            .map(|(start, count)| (self.region.base + start * self.block, count * self.block))
    }

    fn run_containing(&self, address: VirtAddr) -> Option<(usize, usize)> {
        if !self.contains(address) {
            return None;
        }
        let index = (address - self.region.base) / self.block;
        let (&start, &count) = self.runs.range(..=index).next_back()?;
        (index < start + count).then_some((start, count))
    }

    fn is_set(&self, index: usize) -> bool {
        self.bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize, used: bool) {
        let word = &mut self.bitmap[index / WORD_BITS];
        let bit = 1u64 << (index % WORD_BITS);
        if used {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }
}
