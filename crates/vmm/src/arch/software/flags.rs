//! Permission bits of an emulated table entry.

/// The low byte of an emulated entry.
///
/// Bits that exist on x86_64 keep their x86_64 positions. The emulated entry has no high
/// bits to spare, so no-execute moves down to bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(usize);

const PRESENT: usize = 0x01;
const WRITABLE: usize = 0x02;
const USER: usize = 0x04;
const NO_EXECUTE: usize = 0x80;

/// Generates a getter and setter pair for one bit.
macro_rules! flag_accessors {
    ($($bit:ident => $get:ident, $set:ident;)*) => {
        $(
            pub fn $get(self) -> bool {
                self.0 & $bit == $bit
            }

            pub fn $set(&mut self, value: bool) {
                self.0 = if value { self.0 | $bit } else { self.0 & !$bit };
            }
        )*
    };
}

impl PageFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags written into intermediate entries. Intermediate levels are never user-visible.
    pub const fn table() -> Self {
        Self(PRESENT | WRITABLE)
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> usize {
        self.0
    }

    flag_accessors! {
        PRESENT => is_present, set_present;
        WRITABLE => is_writable, set_writable;
        USER => is_user, set_user;
        NO_EXECUTE => is_no_execute, set_no_execute;
    }

    /// True when `self` allows at least what `other` allows.
    pub fn permits(self, other: PageFlags) -> bool {
        let grants = |flags: PageFlags| {
            (flags.0 & (WRITABLE | USER)) | (!flags.0 & NO_EXECUTE)
        };
        grants(other) & !grants(self) == 0
    }
}
