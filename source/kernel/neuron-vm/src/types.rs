// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared address types, page arithmetic and handle identifiers.

use core::num::NonZeroU32;

use static_assertions::const_assert;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
const_assert!(PAGE_SIZE.is_power_of_two());

/// Virtual address inside some address space.
pub type VirtAddr = usize;
/// Physical frame address; `0` marks an unbacked page.
pub type PhysAddr = usize;

/// Number of pages needed to cover `length` bytes.
#[inline]
pub const fn page_count(length: usize) -> usize {
    length.div_ceil(PAGE_SIZE)
}

/// Rounds `addr` down to the containing page boundary.
#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_align_up(addr: usize) -> usize {
    page_align_down(addr + PAGE_SIZE - 1)
}

/// Pages touched by `[addr, addr + length)`; `None` when the span does not fit the address space.
#[inline]
pub const fn span_pages(addr: usize, length: usize) -> Option<usize> {
    match page_offset(addr).checked_add(length) {
        Some(span) if span <= usize::MAX - (PAGE_SIZE - 1) => Some(page_count(span)),
        _ => None,
    }
}

/// Byte offset of `addr` within its page.
#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// Identifier type stored in a [`crate::object::HandleTable`].
pub trait HandleKey: Copy + Eq + core::fmt::Debug {
    /// Wraps a raw, non-zero identifier.
    fn from_raw_id(raw: NonZeroU32) -> Self;
    /// Returns the raw identifier.
    fn raw_id(self) -> NonZeroU32;
}

macro_rules! handle_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU32);

        impl $name {
            /// Constructs a handle from a raw value provided by a caller.
            pub fn from_raw(raw: u32) -> Option<Self> {
                NonZeroU32::new(raw).map(Self)
            }

            /// Returns the raw representation of the handle.
            pub fn to_raw(self) -> u32 {
                self.0.get()
            }
        }

        impl HandleKey for $name {
            fn from_raw_id(raw: NonZeroU32) -> Self {
                Self(raw)
            }

            fn raw_id(self) -> NonZeroU32 {
                self.0
            }
        }
    };
}

handle_id!(
    /// Handle referencing a tracked address space.
    SpaceId
);
handle_id!(
    /// Handle referencing a shared-memory buffer.
    ShmId
);
