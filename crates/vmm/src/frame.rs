//! Physical frame handles and the allocator contract.

use core::fmt;

use crate::{PhysicalAddress, address::AddressTranslator, arch};

/// A handle to one physical page.
///
/// The handle carries no ownership: whoever obtained it from a [`FrameAllocator`] is
/// responsible for returning it exactly once.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Frame(PhysicalAddress);

impl Frame {
    /// Returns the frame containing the given physical address.
    #[inline]
    pub const fn containing(address: PhysicalAddress) -> Self {
        Self(address.align_down(arch::PAGE_SIZE))
    }

    /// Returns the frame with the given frame number.
    #[inline]
    pub const fn from_number(number: usize) -> Self {
        Self(PhysicalAddress::new(number * arch::PAGE_SIZE))
    }

    /// Returns the physical address of the first byte of the frame.
    #[inline]
    pub const fn start_address(self) -> PhysicalAddress {
        self.0
    }

    /// Returns the frame number.
    #[inline]
    pub const fn number(self) -> usize {
        self.0.as_usize() / arch::PAGE_SIZE
    }

    /// Returns a pointer to the frame's contents through the direct-map window.
    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        AddressTranslator::current().phys_to_ptr(self.0)
    }

    /// Returns the frame's contents as a byte slice.
    ///
    /// # Safety
    /// The caller must own the frame and must not create overlapping references to it.
    #[inline]
    pub unsafe fn bytes_mut<'a>(self) -> &'a mut [u8] {
        // SAFETY: Every frame is reachable through the direct map and spans one page.
        unsafe { core::slice::from_raw_parts_mut(self.as_ptr::<u8>(), arch::PAGE_SIZE) }
    }

    /// Fills the frame with zeroes.
    ///
    /// # Safety
    /// The caller must own the frame.
    #[inline]
    pub unsafe fn zero(self) {
        // SAFETY: Forwarded from the caller.
        unsafe { core::ptr::write_bytes(self.as_ptr::<u8>(), 0, arch::PAGE_SIZE) };
    }

    /// Copies the contents of `source` into this frame.
    ///
    /// # Safety
    /// The caller must own this frame, and `source` must not be concurrently written.
    #[inline]
    pub unsafe fn copy_from(self, source: Frame) {
        // SAFETY: Distinct frames never overlap; ownership is forwarded from the caller.
        unsafe {
            core::ptr::copy_nonoverlapping(
                source.as_ptr::<u8>(),
                self.as_ptr::<u8>(),
                arch::PAGE_SIZE,
            )
        };
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.0.as_usize())
    }
}

/// Source of physical frames.
///
/// The allocation strategy belongs to the kernel's physical memory manager; the virtual memory
/// manager only relies on this contract. Frames handed out are not zeroed.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame, or returns None when physical memory is exhausted.
    fn allocate_frame(&self) -> Option<Frame>;

    /// Returns a frame previously obtained from [`FrameAllocator::allocate_frame`].
    fn free_frame(&self, frame: Frame);
}
