//! Physical and virtual address newtypes.
//!
//! Page tables store physical addresses, but the kernel can only dereference virtual ones.
//! Every physical byte is reachable through the direct-map window, and the
//! [`AddressTranslator`] is the one place that knows where that window is.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Locates the direct-map window.
///
/// Kernel builds use [`AddressTranslator::Hardware`]: physical address `p` is visible at
/// `p + direct_map_offset`. Host builds point into an [`EmulatedMemory`] buffer instead.
pub enum AddressTranslator {
    Hardware { direct_map_offset: usize },
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(&'static EmulatedMemory),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    #[cfg(any(test, feature = "software-emulation"))]
    pub const fn emulated(memory: &'static EmulatedMemory) -> Self {
        Self::Emulated(memory)
    }

    /// Publishes the translator. Boot code calls this once, before the first table walk.
    ///
    /// # Panics
    ///
    /// Panics if a translator is already published.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        ADDRESS_TRANSLATOR.with(|slot| {
            if slot.get().is_some() {
                panic!("address translator already set");
            }
            slot.call_once(|| &*alloc::boxed::Box::leak(alloc::boxed::Box::new(translator)));
        });
    }

    /// Returns the published translator.
    ///
    /// # Panics
    ///
    /// Panics if [`AddressTranslator::set_current`] has not run.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        let translator = ADDRESS_TRANSLATOR.get();

        #[cfg(any(test, feature = "software-emulation"))]
        let translator = ADDRESS_TRANSLATOR.with(|slot| slot.get().copied());

        translator.unwrap_or_else(|| panic!("address translator not set"))
    }

    /// Returns the kernel address at which `phys` can be read.
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.0.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.translate(phys.0) as usize,
        }
    }

    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

// One machine per test thread.
#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<&'static AddressTranslator> = const { spin::Once::new() };
}

/// Generates the representation and arithmetic shared by both address kinds.
///
/// Arithmetic goes through `new`, so a result outside the valid range panics instead of
/// silently producing an address the hardware would reject.
macro_rules! address_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 % align == 0
            }

            /// Rounds down to a multiple of `align`, which must be a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))?;
                write!(f, "({:#x})", self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, bytes: usize) -> Self {
                Self::new(self.0 + bytes)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, bytes: usize) -> Self {
                Self::new(self.0 - bytes)
            }
        }

        /// Distance in bytes.
        impl Sub for $name {
            type Output = usize;

            fn sub(self, other: Self) -> usize {
                self.0 - other.0
            }
        }
    };
}

address_type!(
    PhysicalAddress,
    "An address in physical memory, no wider than the architecture's physical address bus."
);

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if `addr` is wider than the physical address bus.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        match arch::validate_physical(addr) {
            true => Some(Self(addr)),
            false => None,
        }
    }
}

address_type!(
    VirtualAddress,
    "A canonical virtual address: the bits above the implemented width copy the top one."
);

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if `addr` is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        match arch::validate_virtual(addr) {
            true => Some(Self(addr)),
            false => None,
        }
    }

    /// Byte offset within the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % arch::PAGE_SIZE
    }

    /// Index into the table at `level`, where level 0 holds the leaf entries.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// True for addresses translated by the shared kernel half of every root table.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.page_index(arch::PAGE_TABLE_LEVELS - 1) >= arch::KERNEL_ROOT_INDEX
    }
}
