// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Conformity: handing out a view whose frames satisfy a physical placement constraint.
//!
//! A conforming source is attached as is. Otherwise a clone is created under the requested
//! constraint and stays linked to its source for fill and backfill.

extern crate alloc;

use alloc::vec::Vec;

use super::sg::{self, SgEntry};
use super::{ConformFlags, ShmAccess, ShmBuffer, ShmDescriptor, ShmFlags, ShmHandle, ShmKind};
use crate::config::Conformity;
use crate::error::{VmError, VmResult};
use crate::types::ShmId;
use crate::vmm::Vmm;

/// Physical constraints requested by a consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConformityOptions {
    /// Required alignment of the first requested byte; `0` for none.
    pub alignment: usize,
    pub conformity: Conformity,
}

/// True when the run layout already satisfies `options` for content starting at `offset`.
pub fn satisfies(entries: &[SgEntry], options: &ConformityOptions, offset: usize) -> VmResult<bool> {
    let alignment = options.alignment;
    if alignment != 0 && !alignment.is_power_of_two() {
        return Err(VmError::InvalidParams);
    }
    if alignment > 1 {
        match sg::physical_at(entries, offset) {
            Some(address) if address % alignment == 0 => {}
            _ => return Ok(false),
        }
    }
    let mask = options.conformity.page_mask();
    Ok(entries.iter().all(|entry| {
        if entry.is_hole() {
            // Unbacked pages could land anywhere once backed.
            mask == usize::MAX
        } else {
            entry.address.saturating_add(entry.length.saturating_sub(1)) <= mask
        }
    }))
}

impl Vmm {
    /// Returns a mapped view of `[offset, offset + length)` of buffer `id` under `options`.
    ///
    /// When the source already conforms the caller is attached to it and the returned
    /// handle carries the source id. Otherwise the handle names a new buffer, clamped to the
    /// source content past `offset`, that keeps a reference on the source until detach.
    pub fn shm_conform(
        &self,
        id: ShmId,
        options: ConformityOptions,
        flags: ConformFlags,
        access: ShmAccess,
        offset: usize,
        length: usize,
    ) -> VmResult<ShmHandle> {
        if length == 0 {
            return Err(VmError::InvalidParams);
        }
        let source = self.shm.acquire(id).ok_or(VmError::NotFound)?;
        let verdict = self.check_private(&source).and_then(|()| {
            if offset >= source.length() {
                return Err(VmError::InvalidParams);
            }
            satisfies(&source.scatter_gather(), &options, offset)
        });
        let conforming = match verdict {
            Ok(conforming) => conforming,
            Err(error) => {
                self.release_buffer(id);
                return Err(error);
            }
        };

        if conforming {
            let attached = self.shm_attach(id);
            self.release_buffer(id);
            let mut handle = attached?;
            if let Err(error) = self.shm_map(&mut handle, offset, length, access) {
                if let Err(detach) = self.shm_detach(&mut handle) {
                    log_warn!(target: "shm", "detach after failed conform map: {}", detach);
                }
                return Err(error);
            }
            return Ok(handle);
        }

        let clamped = length.min(source.length() - offset);
        let inherited = source.flags() & (ShmFlags::PRIVATE | ShmFlags::CLEAN);
        let descriptor = ShmDescriptor::new(clamped, ShmKind::Regular)
            .flags(ShmFlags::COMMIT | inherited)
            .access(access)
            .conformity(options.conformity);
        let mut handle = match self.shm_create(&descriptor) {
            Ok(handle) => handle,
            Err(error) => {
                self.release_buffer(id);
                return Err(error);
            }
        };
        handle.source_id = Some(id);
        handle.source_flags = flags;
        handle.source_offset = offset;

        if flags.contains(ConformFlags::FILL_ON_CREATION) {
            let filled = self
                .shm_buffer(handle.id)
                .and_then(|clone| self.copy_contents(&source, offset, &clone, 0, clamped));
            if let Err(error) = filled {
                handle.source_flags = ConformFlags::empty();
                if let Err(detach) = self.shm_detach(&mut handle) {
                    log_warn!(target: "shm", "detach after failed fill: {}", detach);
                }
                return Err(error);
            }
        }
        log_debug!(
            target: "shm",
            "buffer {} conformed into {} at +0x{:x}",
            id.to_raw(),
            handle.id.to_raw(),
            offset
        );
        Ok(handle)
    }

    /// Copies a clone's content back into its source when the handle asked for it.
    pub(crate) fn backfill(&self, handle: &ShmHandle) -> VmResult<()> {
        let Some(source_id) = handle.source_id.filter(|_| handle.source_flags.contains(ConformFlags::BACKFILL_ON_UNMAP))
        else {
            return Ok(());
        };
        let source = self.shm.lookup(source_id).ok_or(VmError::NotFound)?;
        let clone = self.shm.lookup(handle.id).ok_or(VmError::NotFound)?;
        let length = clone.length().min(source.length().saturating_sub(handle.source_offset));
        self.copy_contents(&clone, 0, &source, handle.source_offset, length)
    }

    fn copy_contents(
        &self,
        from: &ShmBuffer,
        from_offset: usize,
        to: &ShmBuffer,
        to_offset: usize,
        length: usize,
    ) -> VmResult<()> {
        let mut scratch = Vec::new();
        scratch.try_reserve_exact(length).map_err(|_| VmError::OutOfMemory)?;
        scratch.resize(length, 0u8);
        self.read_runs(from, from_offset, &mut scratch)?;
        self.write_runs(to, to_offset, &scratch)
    }
}
