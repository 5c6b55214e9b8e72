// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scatter-gather lists: coalesced physical runs of a buffer and run-wise kernel access.

extern crate alloc;

use alloc::vec::Vec;

use super::ShmBuffer;
use crate::error::{VmError, VmResult};
use crate::mm::{MapOptions, MappingFlags, PhysicalPlacement, VirtualPlacement};
use crate::types::{page_align_down, page_offset, PhysAddr, ShmId, VirtAddr, PAGE_SIZE};
use crate::vmm::Vmm;

/// One physically contiguous run; `address == 0` marks an unbacked hole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub address: PhysAddr,
    pub length: usize,
}

impl SgEntry {
    pub fn is_hole(&self) -> bool {
        self.address == 0
    }
}

fn same_run(previous: PhysAddr, next: PhysAddr) -> bool {
    (previous != 0 && previous + PAGE_SIZE == next) || (previous == 0 && next == 0)
}

/// Coalesces `pages` into maximal runs; the first backed run starts at `offset`.
pub fn build(pages: &[PhysAddr], offset: usize) -> Vec<SgEntry> {
    let mut entries: Vec<SgEntry> = Vec::new();
    let mut previous = None;
    for &page in pages {
        match (previous, entries.last_mut()) {
            (Some(last), Some(entry)) if same_run(last, page) => entry.length += PAGE_SIZE,
            _ => entries.push(SgEntry { address: page, length: PAGE_SIZE }),
        }
        previous = Some(page);
    }
    if let Some(first) = entries.first_mut() {
        if !first.is_hole() {
            first.address += offset;
        }
        first.length -= offset.min(first.length);
    }
    entries
}

/// Re-expands runs produced by [`build`] into one entry per page.
pub fn expand(entries: &[SgEntry], offset: usize) -> Vec<PhysAddr> {
    let mut pages = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let (start, length) = match index {
            0 if !entry.is_hole() => (entry.address - offset, entry.length + offset),
            0 => (0, entry.length + offset),
            _ => (entry.address, entry.length),
        };
        for page in 0..length / PAGE_SIZE {
            pages.push(if start == 0 { 0 } else { start + page * PAGE_SIZE });
        }
    }
    pages
}

/// Physical address of content byte `position`, `None` inside a hole or past the end.
pub fn physical_at(entries: &[SgEntry], position: usize) -> Option<PhysAddr> {
    let mut start = 0;
    for entry in entries {
        if position < start + entry.length {
            return (!entry.is_hole()).then(|| entry.address + (position - start));
        }
        start += entry.length;
    }
    None
}

impl Vmm {
    /// Scatter-gather list of a buffer's physical pages.
    pub fn shm_scatter_gather(&self, id: ShmId) -> VmResult<Vec<SgEntry>> {
        let buffer = self.shm.lookup(id).ok_or(VmError::NotFound)?;
        Ok(buffer.scatter_gather())
    }

    /// Visits `[offset, offset + length)` of a buffer's content run by run.
    ///
    /// Each run is reached through a temporary global mapping of its frames, unmapped again
    /// before the next run. `visit` gets the kernel address and the matching byte range
    /// relative to `offset`. A hole inside the range is `Buffer`.
    pub(crate) fn with_runs<F>(
        &self,
        buffer: &ShmBuffer,
        offset: usize,
        length: usize,
        mut visit: F,
    ) -> VmResult<()>
    where
        F: FnMut(VirtAddr, core::ops::Range<usize>) -> VmResult<()>,
    {
        let end = offset.checked_add(length).ok_or(VmError::InvalidParams)?;
        let kernel = self.kernel.clone();
        let mut start = 0;
        for entry in buffer.scatter_gather() {
            let run_end = start + entry.length;
            let (from, to) = (offset.max(start), end.min(run_end));
            if from < to {
                if entry.is_hole() {
                    return Err(VmError::Buffer);
                }
                let physical = entry.address + (from - start);
                let span = page_offset(physical) + (to - from);
                let options = MapOptions::new(span, MappingFlags::COMMIT | MappingFlags::PERSISTENT, VirtualPlacement::Global)
                    .physical(PhysicalPlacement::Contiguous(page_align_down(physical)));
                let window = self.map(&kernel, options)?;
                let visited = visit(window + page_offset(physical), (from - offset)..(to - offset));
                if let Err(error) = self.unmap(&kernel, window, span) {
                    log_warn!(target: "shm", "temporary window 0x{:x} not released: {}", window, error);
                }
                visited?;
            }
            if run_end >= end {
                break;
            }
            start = run_end;
        }
        Ok(())
    }

    /// Copies buffer content into `out`, which covers `[offset, offset + out.len())`.
    pub(crate) fn read_runs(&self, buffer: &ShmBuffer, offset: usize, out: &mut [u8]) -> VmResult<()> {
        let mmu = &self.machine.mmu;
        let block = self.kernel.platform();
        self.with_runs(buffer, offset, out.len(), |address, range| {
            mmu.read_bytes(&block, address, &mut out[range])
        })
    }

    /// Copies `data` into buffer content at `offset`.
    pub(crate) fn write_runs(&self, buffer: &ShmBuffer, offset: usize, data: &[u8]) -> VmResult<()> {
        let mmu = &self.machine.mmu;
        let block = self.kernel.platform();
        self.with_runs(buffer, offset, data.len(), |address, range| {
            mmu.write_bytes(&block, address, &data[range])
        })
    }
}
