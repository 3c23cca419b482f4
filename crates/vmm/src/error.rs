//! Error taxonomy for virtual memory operations.

use core::fmt;

/// Errors returned by mapping-table and fault-resolution operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A length, offset or address was misaligned or out of range, or the offset lies beyond
    /// the backing store.
    InvalidArgument,
    /// No virtual range or physical frame was available.
    OutOfMemory,
    /// The access is not allowed by the covering mapping.
    PermissionDenied,
    /// No mapping covers the address.
    NotFound,
}

impl VmError {
    /// Returns the negative errno value reported to user space.
    pub const fn errno(self) -> isize {
        match self {
            Self::InvalidArgument => -22,
            Self::OutOfMemory => -12,
            Self::PermissionDenied => -13,
            Self::NotFound => -14,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::NotFound => write!(f, "no mapping covers the address"),
        }
    }
}

impl core::error::Error for VmError {}
