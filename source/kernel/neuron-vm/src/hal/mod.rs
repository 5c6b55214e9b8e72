// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Collaborator contracts consumed by the memory core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Mmu, FrameAllocator, CoreMesh, CoreMessage, Tlb, PlatformBlock
//! DEPENDS_ON: architecture page-table driver, physical allocator, scheduler IPI layer
//! INVARIANTS: Multi-page calls report pages actually affected; callers roll back from that count

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{VmError, VmResult};
use crate::mm::flags::MappingFlags;
use crate::types::{PhysAddr, SpaceId, VirtAddr};

#[cfg(any(test, feature = "soft-hal"))]
pub mod soft;

/// Number of opaque words in a platform page-table block.
pub const PLATFORM_WORDS: usize = 4;

/// Opaque page-table state owned by the MMU driver; word 0 names the root table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlatformBlock {
    pub words: [usize; PLATFORM_WORDS],
}

impl PlatformBlock {
    pub fn root(&self) -> usize {
        self.words[0]
    }
}

/// Partial failure: `completed` pages were affected before `error` occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuFault {
    pub error: VmError,
    pub completed: usize,
}

impl MmuFault {
    pub const fn new(error: VmError, completed: usize) -> Self {
        Self { error, completed }
    }
}

/// Result of clearing a run of page-table entries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClearedPages {
    /// Entries removed (reserved or committed).
    pub cleared: usize,
    /// Frames of cleared committed, non-persistent entries; the caller frees them.
    pub freeable: Vec<PhysAddr>,
}

/// Result of an attribute update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeUpdate {
    /// Attributes of the first page before the update.
    pub previous: MappingFlags,
    /// Pages updated; fewer than requested means the run hit an unmapped page.
    pub updated: usize,
}

/// Architecture page-table driver.
pub trait Mmu: Send + Sync {
    /// Page-table block of the boot (kernel domain) address space.
    fn kernel_space(&self) -> PlatformBlock;

    /// Installs entries with no physical backing.
    fn reserve_pages(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        count: usize,
        flags: MappingFlags,
    ) -> Result<usize, MmuFault>;

    /// Maps `pages[i]` at `address + i * PAGE_SIZE`, replacing existing entries.
    fn set_pages(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        pages: &[PhysAddr],
        flags: MappingFlags,
    ) -> Result<usize, MmuFault>;

    /// Maps `count` physically contiguous frames starting at `physical`.
    fn set_contiguous_pages(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        physical: PhysAddr,
        count: usize,
        flags: MappingFlags,
    ) -> Result<usize, MmuFault>;

    /// Removes entries; absent entries are skipped.
    fn clear_pages(&self, space: &PlatformBlock, address: VirtAddr, count: usize) -> ClearedPages;

    /// Backs previously reserved entries with `pages`.
    fn commit_pages(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        pages: &[PhysAddr],
    ) -> Result<usize, MmuFault>;

    /// Fills `out` with the translation of each page (`0` when unbacked); returns pages retrieved.
    fn virtual_to_physical(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        out: &mut [PhysAddr],
    ) -> VmResult<usize>;

    fn update_page_attributes(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        count: usize,
        flags: MappingFlags,
    ) -> Result<AttributeUpdate, MmuFault>;

    /// Fills `out` with per-page attributes; absent entries report empty flags.
    fn page_attributes(
        &self,
        space: &PlatformBlock,
        address: VirtAddr,
        out: &mut [MappingFlags],
    ) -> VmResult<usize>;

    fn switch_space(&self, space: &PlatformBlock) -> VmResult<()>;

    /// Finishes a new space seeded from `parent`; `inherit` shares the parent's user layout.
    fn clone_space(
        &self,
        parent: &PlatformBlock,
        target: &mut PlatformBlock,
        inherit: bool,
    ) -> VmResult<()>;

    fn destroy_space(&self, space: &PlatformBlock);

    /// Privileged read through the translation of `space`.
    fn read_bytes(&self, space: &PlatformBlock, address: VirtAddr, buf: &mut [u8]) -> VmResult<()>;

    /// Privileged write through the translation of `space`.
    fn write_bytes(&self, space: &PlatformBlock, address: VirtAddr, data: &[u8]) -> VmResult<()>;

    fn zero_pages(&self, space: &PlatformBlock, address: VirtAddr, count: usize) -> VmResult<()>;
}

/// Physical frame allocator.
pub trait FrameAllocator: Send + Sync {
    /// Fills every slot of `out` with a frame whose last byte is at or below `mask`.
    fn allocate(&self, mask: usize, out: &mut [PhysAddr]) -> VmResult<()>;

    /// Returns frames; `0` entries are ignored.
    fn free(&self, pages: &[PhysAddr]);
}

/// Per-core translation cache.
pub trait Tlb {
    fn invalidate_range(&self, address: VirtAddr, length: usize);
}

/// State of a recipient core at delivery time.
pub struct CoreView<'a> {
    pub current: Option<SpaceId>,
    pub parent: Option<SpaceId>,
    pub tlb: &'a dyn Tlb,
}

/// Function executed on a remote core.
pub trait CoreMessage: Send + Sync {
    fn deliver(&self, core: &CoreView<'_>);
}

/// Inter-core messaging and scheduler hooks.
pub trait CoreMesh: Send + Sync {
    fn active_cores(&self) -> usize;

    /// Space running on the calling core, if a thread is active.
    fn current_space(&self) -> Option<SpaceId>;

    /// Queues `message` on every other active core; returns the number of recipients.
    fn broadcast(&self, message: Arc<dyn CoreMessage>) -> usize;

    fn sleep_ms(&self, ms: u32);
}
