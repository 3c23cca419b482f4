//! A software MMU for host builds.
//!
//! Tables are one page each and live in frames of an [`EmulatedMemory`] buffer, so the walker
//! runs the same code it runs against hardware. Nothing translates loads and stores through
//! these tables; tests read them back through the page directory.

mod entry;
mod flags;
mod memory;
mod table;

use core::cell::Cell;

use crate::{PhysicalAddress, VirtualAddress};

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use memory::EmulatedMemory;
pub use table::PageTable;

// Scaled down from x86_64: 256-byte pages, 32-entry tables, three levels, which gives a
// 23-bit virtual space with the kernel half starting at bit 22.
pub const MAX_PHYSICAL_BITS: usize = 20;
pub const MAX_VIRTUAL_BITS: usize = 23;

pub const PAGE_SHIFT: usize = 8;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const INDEX_BITS: usize = 5;
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Root slots from here up are the kernel half, shared by every address space.
pub const KERNEL_ROOT_INDEX: usize = ENTRY_COUNT / 2;

/// User mappings live in `[USER_START, USER_END)`.
pub const USER_START: usize = 0x0000_1000;
pub const USER_END: usize = 0x003F_0000;

/// Addresses picked by the kernel for mappings without a usable hint.
pub const MMAP_START: usize = 0x0020_0000;
pub const MMAP_END: usize = 0x003E_0000;

std::thread_local! {
    static FLUSHES: Cell<usize> = const { Cell::new(0) };
    static ACTIVE_ROOT: Cell<Option<PhysicalAddress>> = const { Cell::new(None) };
}

/// Invalidates the local translation cache for one page.
///
/// The emulated MMU has no cache, so this only counts invalidations for tests to observe.
pub fn flush_local(_virt: VirtualAddress) {
    FLUSHES.with(|f| f.set(f.get() + 1));
}

/// Returns the number of invalidations issued on this thread.
pub fn flush_count() -> usize {
    FLUSHES.with(|f| f.get())
}

/// Loads the root table into the emulated MMU.
///
/// # Safety
/// Mirrors the hardware contract: `root` must be the root of a complete hierarchy that maps the
/// kernel half.
pub unsafe fn activate(root: PhysicalAddress) {
    ACTIVE_ROOT.with(|r| r.set(Some(root)));
}

/// Returns the root most recently loaded on this thread.
pub fn active_root() -> Option<PhysicalAddress> {
    ACTIVE_ROOT.with(|r| r.get())
}

/// Runs `f` with interrupts masked. The emulated CPU takes no interrupts.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}
