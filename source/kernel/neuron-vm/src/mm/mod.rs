// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-memory core (allocation ledger, address spaces, mapping engine, sync)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, AddressSpaceContext, MapOptions, MappingFlags, Vmm mapping operations
//! DEPENDS_ON: hal collaborators, object::HandleTable, config::MachineLayout
//! INVARIANTS: Context lock never held across MMU or frame calls; map/unmap sync before return

pub mod address_space;
pub mod flags;
pub mod ledger;
pub mod map;
pub mod pool;
pub mod sync;

#[cfg(test)]
mod tests_prop;

pub use address_space::{AddressSpace, SpaceFlags};
pub use flags::{MapOptions, MappingFlags, PhysicalPlacement, VirtualPlacement};
pub use ledger::{AddressSpaceContext, Allocation, ReleaseOutcome};
pub use map::{MemoryDescriptor, ProtectionChange};
pub use sync::{SyncOutcome, SyncScope};
