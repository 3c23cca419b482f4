//! Emulated table entries.

use crate::PhysicalAddress;

use super::{PAGE_SIZE, flags::PageFlags};

// Bits 8..20 hold the frame, bits 0..8 the flags. Everything above is reserved.
const FRAME_BITS: usize = 0x000F_FF00;
const FLAG_BITS: usize = 0x0000_00FF;

/// One slot of an emulated table: a frame number and its permission byte in one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(address.is_aligned(PAGE_SIZE), "unaligned frame in table entry");
        Self((address.as_usize() & FRAME_BITS) | (flags.to_raw() & FLAG_BITS))
    }

    /// The frame this entry points at, or None when the present bit is clear.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new(self.0 & FRAME_BITS))
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & FLAG_BITS)
    }

    /// Replaces the permission byte and keeps the frame.
    pub fn set_flags(&mut self, flags: PageFlags) {
        *self = Self((self.0 & FRAME_BITS) | (flags.to_raw() & FLAG_BITS));
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_and_flags_share_a_word() {
        let mut flags = PageFlags::table();
        flags.set_user(true);
        let mut entry = PageEntry::new(PhysicalAddress::new(0x4_2300), flags);

        assert_eq!(entry.as_usize(), 0x4_2307);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x4_2300)));

        entry.set_flags(PageFlags::empty());
        assert_eq!(entry.address(), None);
        assert_eq!(entry.as_usize(), 0x4_2300);

        entry.clear();
        assert_eq!(entry, PageEntry::default());
    }
}
