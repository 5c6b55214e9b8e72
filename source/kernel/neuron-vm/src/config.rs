// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Machine virtual layout, synchronizer bounds and physical conformity masks
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Region, MachineLayout, SyncPolicy, Conformity
//! INVARIANTS: Regions are page aligned, non-empty and pairwise disjoint once validated

use crate::error::{VmError, VmResult};
use crate::types::{VirtAddr, PAGE_SIZE};

/// Half-open virtual range `[base, base + length)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub base: VirtAddr,
    pub length: usize,
}

impl Region {
    pub const fn new(base: VirtAddr, length: usize) -> Self {
        Self { base, length }
    }

    /// Exclusive end address.
    pub const fn end(&self) -> VirtAddr {
        self.base + self.length
    }

    pub const fn contains(&self, address: VirtAddr) -> bool {
        address >= self.base && address < self.end()
    }

    const fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Virtual regions the machine hands to the memory core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineLayout {
    /// Per-process heap; each Context draws from its own copy of this range.
    pub user_heap: Region,
    /// Per-space thread-local range.
    pub thread_local: Region,
    /// Machine-wide range visible from every address space.
    pub global_access: Region,
    /// Allocation granularity of the region pools.
    pub granularity: usize,
}

impl MachineLayout {
    /// Validates alignment and disjointness of every region.
    pub fn validate(&self) -> VmResult<()> {
        if self.granularity == 0
            || !self.granularity.is_power_of_two()
            || self.granularity % PAGE_SIZE != 0
        {
            return Err(VmError::InvalidParams);
        }
        let regions = [self.user_heap, self.thread_local, self.global_access];
        for region in regions.iter() {
            if region.length == 0
                || region.base == 0
                || region.base % PAGE_SIZE != 0
                || region.length % PAGE_SIZE != 0
                || region.base.checked_add(region.length).is_none()
            {
                return Err(VmError::InvalidParams);
            }
        }
        for (i, a) in regions.iter().enumerate() {
            for b in regions.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(VmError::InvalidParams);
                }
            }
        }
        Ok(())
    }
}

impl Default for MachineLayout {
    fn default() -> Self {
        Self {
            user_heap: Region::new(0x4000_0000, 0x4000_0000),
            thread_local: Region::new(0x2000_0000, 0x0100_0000),
            global_access: Region::new(0xC000_0000, 0x1000_0000),
            granularity: PAGE_SIZE,
        }
    }
}

/// Bounds for the cross-core invalidation wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncPolicy {
    pub poll_interval_ms: u32,
    pub timeout_ms: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self { poll_interval_ms: 5, timeout_ms: 1000 }
    }
}

/// Physical placement constraint a buffer's frames must satisfy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Conformity {
    #[default]
    None,
    /// Below 16 MiB (legacy DMA).
    Low,
    /// Below 4 GiB.
    Bits32,
}

impl Conformity {
    /// Highest physical address (inclusive) a conforming frame may touch.
    pub const fn page_mask(self) -> usize {
        match self {
            Conformity::None => usize::MAX,
            Conformity::Low => 0x00FF_FFFF,
            Conformity::Bits32 => 0xFFFF_FFFF,
        }
    }
}
