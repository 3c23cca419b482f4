//! Kernel-wide virtual memory state.
//!
//! The [`KernelContext`] is built once during boot, after the address translator is set and
//! before the first page fault can occur. It is never torn down.

use crate::{
    FrameAllocator, PageDirectory, VirtualAddress,
    arch::{self, PageFlags},
    frame::Frame,
};

/// Bounds of the user half of every address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLayout {
    /// Lowest address a user mapping may occupy.
    pub user_start: VirtualAddress,
    /// End (exclusive) of the user window.
    pub user_end: VirtualAddress,
    /// Start of the window the virtual range allocator hands out.
    pub mmap_start: VirtualAddress,
    /// End (exclusive) of the window the virtual range allocator hands out.
    pub mmap_end: VirtualAddress,
}

impl UserLayout {
    /// Returns true if `[start, start + length)` lies entirely inside the user window.
    pub fn contains(&self, start: VirtualAddress, length: usize) -> bool {
        start >= self.user_start
            && start
                .as_usize()
                .checked_add(length)
                .is_some_and(|end| end <= self.user_end.as_usize())
    }
}

impl Default for UserLayout {
    fn default() -> Self {
        Self {
            user_start: VirtualAddress::new(arch::USER_START),
            user_end: VirtualAddress::new(arch::USER_END),
            mmap_start: VirtualAddress::new(arch::MMAP_START),
            mmap_end: VirtualAddress::new(arch::MMAP_END),
        }
    }
}

/// Process-wide state shared by every address space.
pub struct KernelContext {
    frames: &'static dyn FrameAllocator,
    shootdown: fn(VirtualAddress),
    layout: UserLayout,
    /// The kernel's own directory; its kernel half is copied into every new address space.
    kernel: spin::Mutex<PageDirectory>,
}

impl KernelContext {
    /// Builds the kernel directory and publishes the context.
    ///
    /// `shootdown` must invalidate the given page on every CPU (including the caller's) and
    /// return only once they have all done so.
    ///
    /// # Panics
    ///
    /// Panics if the context has already been initialized, or if there are not enough frames
    /// to build the kernel half.
    pub fn init(
        frames: &'static dyn FrameAllocator,
        shootdown: fn(VirtualAddress),
        layout: UserLayout,
    ) -> &'static KernelContext {
        assert!(
            layout.user_start <= layout.mmap_start
                && layout.mmap_start < layout.mmap_end
                && layout.mmap_end <= layout.user_end,
            "mmap window must lie inside the user window"
        );

        let context = KernelContext {
            frames,
            shootdown,
            layout,
            kernel: spin::Mutex::new(PageDirectory::new_kernel(frames, shootdown)),
        };

        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if KERNEL_CONTEXT.get().is_some() {
                panic!("kernel context already initialized");
            }
            KERNEL_CONTEXT.call_once(|| context)
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            KERNEL_CONTEXT.with(|c| {
                if c.get().is_some() {
                    panic!("kernel context already initialized");
                }
                *c.call_once(|| &*alloc::boxed::Box::leak(alloc::boxed::Box::new(context)))
            })
        }
    }

    /// Returns the kernel context.
    ///
    /// # Panics
    ///
    /// Panics if [`KernelContext::init`] has not run.
    pub fn current() -> &'static KernelContext {
        #[cfg(not(any(test, feature = "software-emulation")))]
        let context = KERNEL_CONTEXT.get();

        #[cfg(any(test, feature = "software-emulation"))]
        let context = KERNEL_CONTEXT.with(|c| c.get().copied());

        context.unwrap_or_else(|| panic!("kernel context not initialized"))
    }

    /// Returns the physical frame allocator.
    pub fn frames(&self) -> &'static dyn FrameAllocator {
        self.frames
    }

    /// Returns the cross-CPU invalidation hook.
    pub fn shootdown(&self) -> fn(VirtualAddress) {
        self.shootdown
    }

    /// Returns the user layout every address space is created with.
    pub fn layout(&self) -> UserLayout {
        self.layout
    }

    /// Maps a kernel page. The mapping is immediately visible in every address space.
    ///
    /// # Panics
    ///
    /// Panics if `virt` is not in the kernel half.
    pub fn map_kernel_page(&self, virt: VirtualAddress, frame: Frame, writable: bool) {
        assert!(virt.is_kernel(), "kernel mapping outside the kernel half");
        let mut flags = PageFlags::empty();
        flags.set_writable(writable);
        arch::without_interrupts(|| {
            self.kernel.lock().set_mapping(virt, frame, flags);
        });
    }

    /// Unmaps a kernel page on every CPU and returns the frame it referenced.
    pub fn unmap_kernel_page(&self, virt: VirtualAddress) -> Option<Frame> {
        assert!(virt.is_kernel(), "kernel mapping outside the kernel half");
        arch::without_interrupts(|| self.kernel.lock().unmap(virt))
    }

    /// Creates the page directory for a new user address space.
    pub(crate) fn new_user_directory(&self) -> Result<PageDirectory, crate::VmError> {
        arch::without_interrupts(|| PageDirectory::new_user(&self.kernel.lock()))
    }

    /// Loads the kernel directory into the MMU.
    ///
    /// # Safety
    /// See [`crate::AddressSpace::activate`].
    pub unsafe fn activate(&self) {
        let root = self.kernel.lock().root();
        // SAFETY: Forwarded from the caller.
        unsafe { arch::activate(root.start_address()) };
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static KERNEL_CONTEXT: spin::Once<KernelContext> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static KERNEL_CONTEXT: spin::Once<&'static KernelContext> = const { spin::Once::new() };
}
