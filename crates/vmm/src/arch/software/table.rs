//! Emulated page tables.

use super::{ENTRY_COUNT, PAGE_SIZE, entry::PageEntry};

/// One level of the emulated hierarchy.
///
/// 32 entries of one word each fill exactly one 256-byte frame, so tables are allocated from
/// the same frame pool as data pages and reached through the direct map.
#[repr(C, align(256))]
pub struct PageTable([PageEntry; ENTRY_COUNT]);

const _: () = assert!(size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// # Panics
    ///
    /// Panics if `index` is not below [`ENTRY_COUNT`].
    pub fn entry(&self, index: usize) -> PageEntry {
        self.0[index]
    }

    /// # Panics
    ///
    /// Panics if `index` is not below [`ENTRY_COUNT`].
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.0[index]
    }

    pub fn zero(&mut self) {
        self.0.fill(PageEntry::default());
    }
}
