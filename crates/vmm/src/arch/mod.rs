//! Paging hardware.
//!
//! Kernel builds on x86_64 drive the real MMU. Tests and the `software-emulation` feature use
//! a scaled-down machine whose tables live in a heap buffer. Both export the same constants,
//! entry types and primitives, and the address arithmetic below is written once against them.

// Compiled under test too, so both layouts keep type-checking.
#[cfg(target_arch = "x86_64")]
#[cfg_attr(any(test, feature = "software-emulation"), allow(dead_code))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Bytes translated by one entry of a table at `level`.
#[inline]
pub const fn level_span(level: usize) -> usize {
    PAGE_SIZE << (level * INDEX_BITS)
}

/// Index of `address` in the table at `level`. Level 0 is the leaf table.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "no such page table level");
    (address >> (PAGE_SHIFT + level * INDEX_BITS)) % ENTRY_COUNT
}

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// An address is canonical when everything from the top implemented bit up is all zeros or
/// all ones.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let high = addr >> (MAX_VIRTUAL_BITS - 1);
    high == 0 || high == usize::MAX >> (MAX_VIRTUAL_BITS - 1)
}
