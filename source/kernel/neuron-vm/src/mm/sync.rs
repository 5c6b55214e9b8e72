// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-core translation cache synchronization after mapping changes
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vmm::sync_mapping_change, SyncScope, SyncOutcome
//! DEPENDS_ON: hal::{CoreMesh, CoreMessage, Tlb}, config::SyncPolicy
//! INVARIANTS: Bounded wait; a timeout is logged and reported, never escalated

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::address_space::AddressSpace;
use crate::hal::{CoreMessage, CoreView};
use crate::types::{SpaceId, VirtAddr};
use crate::vmm::Vmm;

/// Cores whose caches must drop the changed range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncScope {
    /// The range is visible from every space.
    Everyone,
    /// Cores running this space or one of its children.
    Related(SpaceId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// At most one core is active.
    Skipped,
    Completed { cores: usize },
    /// Some cores never acknowledged; their translations may be stale.
    TimedOut { acked: usize, expected: usize },
}

/// Invalidation message shared with every recipient; outlives an initiator that gave up.
struct SyncRequest {
    scope: SyncScope,
    address: VirtAddr,
    length: usize,
    completed: AtomicUsize,
}

impl CoreMessage for SyncRequest {
    fn deliver(&self, core: &CoreView<'_>) {
        let affected = match self.scope {
            SyncScope::Everyone => true,
            SyncScope::Related(id) => core.current == Some(id) || core.parent == Some(id),
        };
        if affected {
            core.tlb.invalidate_range(self.address, self.length);
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
    }
}

impl Vmm {
    pub(crate) fn sync_scope(&self, space: &AddressSpace, address: VirtAddr) -> SyncScope {
        if self.machine.layout.global_access.contains(address) {
            return SyncScope::Everyone;
        }
        SyncScope::Related(space.parent().unwrap_or(space.id()))
    }

    /// Invalidates `[address, address + length)` on other cores and waits for their acks.
    pub fn sync_mapping_change(
        &self,
        space: &AddressSpace,
        address: VirtAddr,
        length: usize,
    ) -> SyncOutcome {
        let cores = &self.machine.cores;
        if cores.active_cores() <= 1 {
            return SyncOutcome::Skipped;
        }
        let request = Arc::new(SyncRequest {
            scope: self.sync_scope(space, address),
            address,
            length,
            completed: AtomicUsize::new(0),
        });
        let expected = cores.broadcast(request.clone());
        let policy = self.machine.sync;
        let step = policy.poll_interval_ms.max(1);
        let mut waited = 0;
        loop {
            let acked = request.completed.load(Ordering::Acquire);
            if acked >= expected {
                return SyncOutcome::Completed { cores: acked };
            }
            if waited >= policy.timeout_ms {
                log_warn!(
                    target: "mm::sync",
                    "timeout after {}ms: {}/{} cores acknowledged 0x{:x}+0x{:x}",
                    waited,
                    acked,
                    expected,
                    address,
                    length
                );
                return SyncOutcome::TimedOut { acked, expected };
            }
            cores.sleep_ms(step);
            waited += step;
        }
    }
}
