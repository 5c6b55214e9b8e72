// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mapping attributes, placement strategies and map request options.

use bitflags::bitflags;

use crate::error::{VmError, VmResult};
use crate::types::{PhysAddr, ShmId, VirtAddr};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Attributes of a mapping and of the allocation tracking it.
    pub struct MappingFlags: u32 {
        const USERSPACE = 1 << 0;
        const NOCACHE = 1 << 1;
        const READONLY = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Reported by the MMU once a page has been written.
        const ISDIRTY = 1 << 4;
        /// Frames survive the mapping; clearing never returns them for freeing.
        const PERSISTENT = 1 << 5;
        const DOMAIN = 1 << 6;
        const COMMIT = 1 << 7;
        const LOWFIRST = 1 << 8;
        /// Zero-fill after commit.
        const CLEAN = 1 << 9;
        /// Stack mapping with an unmapped guard page below it.
        const GUARDPAGE = 1 << 10;
        const TRAPPAGE = 1 << 11;
        /// Reported by the MMU for any present entry, reserved or committed.
        const MAPPED = 1 << 12;
    }
}

pub const PHYSICAL_DEFAULT: u32 = 0x01;
pub const PHYSICAL_FIXED: u32 = 0x02;
pub const PHYSICAL_CONTIGUOUS: u32 = PHYSICAL_FIXED | 0x04;
pub const PHYSICAL_MASK: u32 = 0x07;

// Virtual strategies sit above the physical bits so the two never alias.
pub const VIRTUAL_GLOBAL: u32 = 0x08;
pub const VIRTUAL_PROCESS: u32 = 0x10;
pub const VIRTUAL_THREAD: u32 = 0x18;
pub const VIRTUAL_FIXED: u32 = 0x20;
pub const VIRTUAL_MASK: u32 = 0x38;

/// Where the virtual range of a mapping comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualPlacement {
    /// Caller-supplied start address.
    Fixed(VirtAddr),
    /// The Context heap of an application space.
    Process,
    /// The space's thread-local pool.
    Thread,
    /// The machine-wide global access pool.
    Global,
}

/// Where the physical backing of a mapping comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhysicalPlacement {
    /// Fresh frames from the physical allocator.
    Allocate,
    /// Caller-supplied page list.
    Fixed,
    /// One physically contiguous run starting at the given frame.
    Contiguous(PhysAddr),
}

/// Decodes raw placement bits as passed through the system-call layer.
pub fn decode_placement(
    bits: u32,
    virtual_start: VirtAddr,
    physical_start: PhysAddr,
) -> VmResult<(VirtualPlacement, PhysicalPlacement)> {
    let virtual_placement = match bits & VIRTUAL_MASK {
        VIRTUAL_FIXED if virtual_start != 0 => VirtualPlacement::Fixed(virtual_start),
        VIRTUAL_PROCESS => VirtualPlacement::Process,
        VIRTUAL_THREAD => VirtualPlacement::Thread,
        VIRTUAL_GLOBAL => VirtualPlacement::Global,
        _ => return Err(VmError::InvalidParams),
    };
    let physical_placement = match bits & PHYSICAL_MASK {
        0 | PHYSICAL_DEFAULT => PhysicalPlacement::Allocate,
        PHYSICAL_FIXED => PhysicalPlacement::Fixed,
        PHYSICAL_CONTIGUOUS => PhysicalPlacement::Contiguous(physical_start),
        _ => return Err(VmError::InvalidParams),
    };
    Ok((virtual_placement, physical_placement))
}

/// Parameters of a [`crate::Vmm::map`] request.
#[derive(Debug)]
pub struct MapOptions<'p> {
    pub length: usize,
    pub flags: MappingFlags,
    pub mask: usize,
    pub shm_tag: Option<ShmId>,
    pub virtual_placement: VirtualPlacement,
    pub physical_placement: PhysicalPlacement,
    /// Read for `Fixed` physical placement, filled for `Allocate`.
    pub pages: Option<&'p mut [PhysAddr]>,
}

impl<'p> MapOptions<'p> {
    pub fn new(length: usize, flags: MappingFlags, placement: VirtualPlacement) -> Self {
        Self {
            length,
            flags,
            mask: usize::MAX,
            shm_tag: None,
            virtual_placement: placement,
            physical_placement: PhysicalPlacement::Allocate,
            pages: None,
        }
    }

    pub fn physical(mut self, placement: PhysicalPlacement) -> Self {
        self.physical_placement = placement;
        self
    }

    pub fn pages(mut self, pages: &'p mut [PhysAddr]) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn mask(mut self, mask: usize) -> Self {
        self.mask = mask;
        self
    }

    pub fn tag(mut self, id: ShmId) -> Self {
        self.shm_tag = Some(id);
        self
    }
}
