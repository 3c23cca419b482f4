//! Hardware page tables and the CR3 root.

use x86_64::{
    PhysAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{self, PhysFrame},
};

use crate::PhysicalAddress;

use super::entry::PageEntry;

/// One 4 KiB level of the PML4 hierarchy, used in place through the direct map.
#[repr(transparent)]
pub struct PageTable(paging::PageTable);

impl PageTable {
    /// # Panics
    ///
    /// Panics if `index` is not below [`super::ENTRY_COUNT`].
    pub fn entry(&self, index: usize) -> PageEntry {
        // SAFETY: Both entry types are a transparent u64.
        unsafe { *(&raw const self.0[index]).cast::<PageEntry>() }
    }

    /// # Panics
    ///
    /// Panics if `index` is not below [`super::ENTRY_COUNT`].
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        // SAFETY: Both entry types are a transparent u64.
        unsafe { &mut *(&raw mut self.0[index]).cast::<PageEntry>() }
    }

    pub fn zero(&mut self) {
        self.0.zero();
    }
}

/// # Safety
///
/// See [`super::activate`].
pub(super) unsafe fn load_root(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    // SAFETY: Forwarded from the caller.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}
