//! x86_64 with 4-level paging.

mod entry;
mod fault;
mod flags;
mod table;

use x86_64::{VirtAddr, instructions};

use crate::{PhysicalAddress, VirtualAddress};

pub use entry::PageEntry;
pub use fault::read_page_fault;
pub use flags::PageFlags;
pub use table::PageTable;

// Real parts may implement up to 52 physical bits; the kernel never maps above 48.
pub const MAX_PHYSICAL_BITS: usize = 48;
pub const MAX_VIRTUAL_BITS: usize = 48;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const INDEX_BITS: usize = 9;
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;
pub const PAGE_TABLE_LEVELS: usize = 4;

/// PML4 slots from here up are the kernel half, shared by every address space.
pub const KERNEL_ROOT_INDEX: usize = ENTRY_COUNT / 2;

/// User mappings live in `[USER_START, USER_END)`.
pub const USER_START: usize = 0x0000_0000_0040_0000;
pub const USER_END: usize = 0x0000_7FFF_FFFF_0000;

/// Addresses picked by the kernel for mappings without a usable hint.
pub const MMAP_START: usize = 0x0000_1000_0000_0000;
pub const MMAP_END: usize = 0x0000_7000_0000_0000;

/// Drops the TLB entry for `virt` on this CPU.
pub fn flush_local(virt: VirtualAddress) {
    instructions::tlb::flush(VirtAddr::new(virt.as_usize() as u64));
}

/// Switches CR3 to `root`.
///
/// # Safety
///
/// `root` must map the kernel half, including the running code and the direct-map window.
pub unsafe fn activate(root: PhysicalAddress) {
    // SAFETY: Forwarded from the caller.
    unsafe { table::load_root(root) };
}

#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    instructions::interrupts::without_interrupts(f)
}
