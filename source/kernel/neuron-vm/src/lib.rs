// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory core for the NEURON kernel
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vmm (map/unmap/commit/clone/protect/query, address spaces, sync, shm_*), Machine
//! DEPENDS_ON: hal::{Mmu, FrameAllocator, CoreMesh} supplied by the platform
//! INVARIANTS: No allocation record outlives its virtual range; failed operations leave no partial state

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod config;
pub mod error;
pub mod hal;
pub mod mm;
pub mod object;
pub mod shm;
pub mod types;
mod vmm;

pub use error::{Progress, VmError, VmResult};
pub use vmm::{Machine, Vmm};
