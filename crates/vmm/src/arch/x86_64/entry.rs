//! Hardware table entries.

use crate::PhysicalAddress;

use super::{PAGE_SIZE, flags::PageFlags};

// Bits 12..52 hold the frame. Everything else is flags or ignored by the MMU.
const FRAME_BITS: usize = 0x000F_FFFF_FFFF_F000;

/// One 64-bit slot of a hardware table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(address.is_aligned(PAGE_SIZE), "unaligned frame in table entry");
        Self((address.as_usize() & FRAME_BITS) | (flags.to_raw() & !FRAME_BITS))
    }

    /// The frame this entry points at, or None when the present bit is clear.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new(self.0 & FRAME_BITS))
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & !FRAME_BITS)
    }

    /// Replaces the flag bits and keeps the frame.
    pub fn set_flags(&mut self, flags: PageFlags) {
        *self = Self((self.0 & FRAME_BITS) | (flags.to_raw() & !FRAME_BITS));
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
