// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error kinds reported by the virtual-memory core.

use core::fmt;

/// Error returned by ledger, mapping and shared-memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Null, zero or malformed input.
    InvalidParams,
    /// Allocation storage, virtual range or physical frames exhausted.
    OutOfMemory,
    /// No allocation, buffer or handle at the given address or id.
    NotFound,
    /// Placement or flag combination not implemented, or forbidden for this role.
    NotSupported,
    /// Partial release with multiple owners, or private-buffer access from an unrelated space.
    Permissions,
    /// Scatter-gather hole where backed memory was required.
    Buffer,
    /// Unspecified driver failure passed through verbatim.
    Unknown,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VmError::InvalidParams => "invalid parameters",
            VmError::OutOfMemory => "out of memory",
            VmError::NotFound => "not found",
            VmError::NotSupported => "not supported",
            VmError::Permissions => "permission denied",
            VmError::Buffer => "scatter-gather hole",
            VmError::Unknown => "unknown driver failure",
        };
        f.write_str(text)
    }
}

/// Result alias used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;

/// Partial-success signal carried inside `Ok`.
///
/// `Incomplete` means more references or pages remain; callers retry or treat it as
/// outstanding work, never as a failure.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Complete,
    Incomplete,
}

impl Progress {
    pub fn is_complete(self) -> bool {
        matches!(self, Progress::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase_text() {
        assert_eq!(VmError::Permissions.to_string(), "permission denied");
        assert_eq!(VmError::Buffer.to_string(), "scatter-gather hole");
    }

    #[test]
    fn progress_completion() {
        assert!(Progress::Complete.is_complete());
        assert!(!Progress::Incomplete.is_complete());
    }
}
