//! Permission bits of a hardware table entry.

use x86_64::structures::paging::PageTableFlags;

/// The flag bits of a hardware entry, low twelve and high twelve bits combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Generates a getter and setter pair for one hardware flag.
macro_rules! flag_accessors {
    ($($flag:ident => $get:ident, $set:ident;)*) => {
        $(
            pub fn $get(self) -> bool {
                self.0.contains(PageTableFlags::$flag)
            }

            pub fn $set(&mut self, value: bool) {
                self.0.set(PageTableFlags::$flag, value);
            }
        )*
    };
}

impl PageFlags {
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Flags written into intermediate entries.
    ///
    /// The MMU requires the user bit at every level of a user walk, so it is set here and
    /// the leaf alone decides whether user code may touch the page.
    pub const fn table() -> Self {
        Self(
            PageTableFlags::PRESENT
                .union(PageTableFlags::WRITABLE)
                .union(PageTableFlags::USER_ACCESSIBLE),
        )
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(PageTableFlags::from_bits_truncate(raw as u64))
    }

    pub const fn to_raw(self) -> usize {
        self.0.bits() as usize
    }

    flag_accessors! {
        PRESENT => is_present, set_present;
        WRITABLE => is_writable, set_writable;
        USER_ACCESSIBLE => is_user, set_user;
        NO_EXECUTE => is_no_execute, set_no_execute;
    }

    /// True when `self` allows at least what `other` allows.
    pub fn permits(self, other: PageFlags) -> bool {
        let grants = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        self.0.contains(other.0 & grants) && (other.is_no_execute() || !self.is_no_execute())
    }
}
