//! Architecture-independent page table management.
//!
//! This module provides the `PageDirectory` type, which owns the root of one table hierarchy
//! and walks it through the direct-map window. Every method assumes the caller holds the
//! page-table lock of the owning address space: exclusive access is expressed through
//! `&mut self`, and [`crate::AddressSpace`] only hands the directory out from behind its lock.

use alloc::vec::Vec;

use crate::{
    FrameAllocator, VirtualAddress, VmError,
    arch::{self, PageEntry, PageFlags, PageTable},
    frame::Frame,
};

/// The state of one virtual page in a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// No frame is mapped at the page.
    Absent,
    /// The page maps `frame` with `flags`.
    Present { frame: Frame, flags: PageFlags },
}

impl Translation {
    /// Returns the mapped frame, if any.
    pub fn frame(self) -> Option<Frame> {
        match self {
            Self::Absent => None,
            Self::Present { frame, .. } => Some(frame),
        }
    }
}

/// Level of the root table.
const ROOT_LEVEL: usize = arch::PAGE_TABLE_LEVELS - 1;

/// Returns the table stored in `frame`.
///
/// # Safety
/// `frame` must hold a page table, and the caller must not create aliasing references to it.
unsafe fn table_at<'a>(frame: Frame) -> &'a mut PageTable {
    // SAFETY: Forwarded from the caller.
    unsafe { &mut *frame.as_ptr::<PageTable>() }
}

/// An architecture-independent page table manager.
///
/// This type owns the root page table and the user-half intermediate tables below it. The
/// kernel half of the root is copied from the kernel directory and its tables are shared, not
/// owned. Leaf frames are never owned by the directory: whoever installs a frame decides who
/// frees it.
pub struct PageDirectory {
    root: Frame,
    frames: &'static dyn FrameAllocator,
    shootdown: fn(VirtualAddress),
}

impl PageDirectory {
    /// Creates the kernel directory.
    ///
    /// Every kernel-half root entry is populated up front so that later kernel mappings land
    /// in tables already shared with every user directory.
    pub(crate) fn new_kernel(
        frames: &'static dyn FrameAllocator,
        shootdown: fn(VirtualAddress),
    ) -> Self {
        let root = Self::alloc_table(frames);
        // SAFETY: The root was just allocated and is not reachable by anyone else.
        let table = unsafe { table_at(root) };
        for index in arch::KERNEL_ROOT_INDEX..arch::ENTRY_COUNT {
            let next = Self::alloc_table(frames);
            *table.entry_mut(index) = PageEntry::new(next.start_address(), PageFlags::table());
        }

        log::debug!(
            "kernel directory at {:?} with {} shared top-level entries",
            root,
            arch::ENTRY_COUNT - arch::KERNEL_ROOT_INDEX
        );

        Self {
            root,
            frames,
            shootdown,
        }
    }

    /// Creates an empty user directory whose kernel half is shared with `kernel`.
    pub(crate) fn new_user(kernel: &PageDirectory) -> Result<Self, VmError> {
        let root = kernel
            .frames
            .allocate_frame()
            .ok_or(VmError::OutOfMemory)?;

        // SAFETY: Both frames hold root tables; the new one is exclusively ours.
        let (table, kernel_table) = unsafe { (table_at(root), table_at(kernel.root)) };
        table.zero();
        for index in arch::KERNEL_ROOT_INDEX..arch::ENTRY_COUNT {
            *table.entry_mut(index) = kernel_table.entry(index);
        }

        Ok(Self {
            root,
            frames: kernel.frames,
            shootdown: kernel.shootdown,
        })
    }

    /// Returns the frame holding the root table.
    pub fn root(&self) -> Frame {
        self.root
    }

    /// Loads this directory into the MMU of the current CPU.
    ///
    /// # Safety
    /// The directory must stay alive for as long as it is loaded on any CPU.
    pub unsafe fn activate(&self) {
        // SAFETY: The kernel half is always present; lifetime is forwarded from the caller.
        unsafe { arch::activate(self.root.start_address()) };
    }

    /// Allocates and zeroes a table for one level of the hierarchy.
    ///
    /// # Panics
    ///
    /// Panics when physical memory is exhausted.
    fn alloc_table(frames: &dyn FrameAllocator) -> Frame {
        let frame = frames
            .allocate_frame()
            .unwrap_or_else(|| panic!("no physical frame available for a page table level"));
        // SAFETY: Freshly allocated frame, owned by this directory from now on.
        unsafe { table_at(frame) }.zero();
        frame
    }

    /// Finds the level 0 table covering `virt` without allocating.
    fn find_table(&self, virt: VirtualAddress) -> Option<Frame> {
        let mut table = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `table` is the root or was reached through a present table entry.
            let entry = unsafe { table_at(table) }.entry(virt.page_index(level));
            table = Frame::containing(entry.address()?);
        }
        Some(table)
    }

    /// Finds the level 0 table covering `virt`, allocating missing levels on the way down.
    fn find_or_create_table(&mut self, virt: VirtualAddress) -> Frame {
        let mut table = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `table` is the root or was reached through a present table entry, and
            // `&mut self` means nobody else is walking this directory.
            let entry = unsafe { table_at(table) }.entry_mut(virt.page_index(level));
            table = match entry.address() {
                Some(next) => Frame::containing(next),
                None => {
                    let next = Self::alloc_table(self.frames);
                    *entry = PageEntry::new(next.start_address(), PageFlags::table());

                    #[cfg(feature = "detailed-logging")]
                    log::trace!("level {} table {:?} created for {}", level - 1, next, virt);

                    next
                }
            };
        }
        table
    }

    fn assert_page_aligned(virt: VirtualAddress) {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );
    }

    /// Looks up the translation of the page containing `virt`.
    ///
    /// Never allocates: a missing level simply means the page is absent.
    pub fn get_mapping(&self, virt: VirtualAddress) -> Translation {
        let Some(table) = self.find_table(virt) else {
            return Translation::Absent;
        };
        // SAFETY: `find_table` only returns frames holding tables.
        let entry = unsafe { table_at(table) }.entry(virt.page_index(0));
        match entry.address() {
            Some(address) => Translation::Present {
                frame: Frame::containing(address),
                flags: entry.flags(),
            },
            None => Translation::Absent,
        }
    }

    /// Maps the page at `virt` to `frame`. The present bit is added to `flags`.
    ///
    /// Returns the frame previously mapped there, if any; replacing a translation invalidates
    /// it on every CPU before returning.
    ///
    /// # Panics
    ///
    /// Panics if `virt` is not page-aligned.
    pub fn set_mapping(
        &mut self,
        virt: VirtualAddress,
        frame: Frame,
        mut flags: PageFlags,
    ) -> Option<Frame> {
        Self::assert_page_aligned(virt);

        let table = self.find_or_create_table(virt);
        // SAFETY: Exclusive access through `&mut self`.
        let entry = unsafe { table_at(table) }.entry_mut(virt.page_index(0));
        let previous = entry.address().map(Frame::containing);

        flags.set_present(true);
        *entry = PageEntry::new(frame.start_address(), flags);

        if previous.is_some() {
            (self.shootdown)(virt);
        }
        previous
    }

    /// Replaces the attributes of the page at `virt`, keeping its frame.
    ///
    /// Returns the previous attributes, or None if the page is absent. Like every write
    /// through the walker, missing levels are allocated on the way down; an absent leaf is
    /// left absent. Removing a permission invalidates the translation on every CPU.
    pub fn set_attributes(&mut self, virt: VirtualAddress, mut flags: PageFlags) -> Option<PageFlags> {
        Self::assert_page_aligned(virt);

        let table = self.find_or_create_table(virt);
        // SAFETY: Exclusive access through `&mut self`.
        let entry = unsafe { table_at(table) }.entry_mut(virt.page_index(0));
        let previous = entry.flags();
        if !previous.is_present() {
            return None;
        }

        flags.set_present(true);
        entry.set_flags(flags);

        if !flags.permits(previous) {
            (self.shootdown)(virt);
        }
        Some(previous)
    }

    /// Removes the translation of the page at `virt` and returns the frame it referenced.
    ///
    /// The translation is invalidated on every CPU before this returns.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<Frame> {
        Self::assert_page_aligned(virt);

        let table = self.find_table(virt)?;
        // SAFETY: Exclusive access through `&mut self`.
        let entry = unsafe { table_at(table) }.entry_mut(virt.page_index(0));
        let frame = entry.address().map(Frame::containing)?;
        entry.clear();

        (self.shootdown)(virt);
        Some(frame)
    }

    /// Lists every present user-half leaf.
    pub fn user_pages(&self) -> Vec<(VirtualAddress, Translation)> {
        let mut pages = Vec::new();
        Self::collect_leaves(self.root, ROOT_LEVEL, 0, &mut pages);
        pages
    }

    fn collect_leaves(
        table: Frame,
        level: usize,
        base: usize,
        out: &mut Vec<(VirtualAddress, Translation)>,
    ) {
        let indices = if level == ROOT_LEVEL {
            0..arch::KERNEL_ROOT_INDEX
        } else {
            0..arch::ENTRY_COUNT
        };

        for index in indices {
            // SAFETY: Only frames reached through present table entries are visited.
            let entry = unsafe { table_at(table) }.entry(index);
            let Some(address) = entry.address() else {
                continue;
            };
            let virt = base + index * arch::level_span(level);
            if level == 0 {
                out.push((
                    VirtualAddress::new(virt),
                    Translation::Present {
                        frame: Frame::containing(address),
                        flags: entry.flags(),
                    },
                ));
            } else {
                Self::collect_leaves(Frame::containing(address), level - 1, virt, out);
            }
        }
    }

    /// Builds a copy of this directory's user half for a child address space.
    ///
    /// Pages for which `shared` returns true keep referencing the same frame; every other
    /// page is copied into a fresh frame, so the child can modify it without the parent seeing
    /// the change. On exhaustion the partial child is released and nothing leaks.
    pub fn duplicate(&self, shared: &dyn Fn(VirtualAddress) -> bool) -> Result<PageDirectory, VmError> {
        let mut child = PageDirectory::new_user(self)?;

        for (virt, translation) in self.user_pages() {
            let Translation::Present { frame, flags } = translation else {
                continue;
            };

            if shared(virt) {
                child.set_mapping(virt, frame, flags);
                continue;
            }

            let Some(copy) = self.frames.allocate_frame() else {
                child.clear_user_pages(shared);
                return Err(VmError::OutOfMemory);
            };
            // SAFETY: `copy` is fresh; the source page is only read.
            unsafe { copy.copy_from(frame) };
            child.set_mapping(virt, copy, flags);
        }

        Ok(child)
    }

    /// Removes every user-half translation, freeing each frame for which `keep` returns false.
    ///
    /// No invalidation is broadcast: the directory must not be loaded on any CPU.
    pub fn clear_user_pages(&mut self, keep: &dyn Fn(VirtualAddress) -> bool) {
        for (virt, translation) in self.user_pages() {
            let Some(table) = self.find_table(virt) else {
                continue;
            };
            // SAFETY: Exclusive access through `&mut self`.
            unsafe { table_at(table) }.entry_mut(virt.page_index(0)).clear();

            if let Some(frame) = translation.frame() {
                if !keep(virt) {
                    self.frames.free_frame(frame);
                }
            }
        }
    }

    fn free_table(&self, table: Frame, level: usize) {
        if level > 0 {
            for index in 0..arch::ENTRY_COUNT {
                // SAFETY: Only frames reached through present table entries are visited.
                let entry = unsafe { table_at(table) }.entry(index);
                if let Some(address) = entry.address() {
                    self.free_table(Frame::containing(address), level - 1);
                }
            }
        }
        self.frames.free_frame(table);
    }
}

impl Drop for PageDirectory {
    /// Frees the user-half tables and the root. Leaf frames still mapped are not touched.
    fn drop(&mut self) {
        for index in 0..arch::KERNEL_ROOT_INDEX {
            // SAFETY: The root is owned by this directory.
            let entry = unsafe { table_at(self.root) }.entry(index);
            if let Some(address) = entry.address() {
                self.free_table(Frame::containing(address), ROOT_LEVEL - 1);
            }
        }
        self.frames.free_frame(self.root);
    }
}
