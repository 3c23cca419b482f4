//! Per-process address spaces.
//!
//! An [`AddressSpace`] pairs a [`PageDirectory`] with the table of mappings that decides what
//! each user page should hold. Pages are loaded lazily by [`AddressSpace::resolve_fault`].
//!
//! Two locks guard an address space. The mapping lock covers the mapping table and the range
//! allocator; the page-table lock covers the directory. When both are needed the mapping lock
//! is taken first. Backing-store calls may block, so they are queued while the mapping lock is
//! held and made once it has been released.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    BackingStore, Frame, FrameAllocator, KernelContext, PageDirectory, PageFlags, Translation,
    VirtualAddress, VirtualRange, VmError,
    arch::{self, PAGE_SIZE},
    context::UserLayout,
    fault::{FaultCause, PageFault},
    mapping::{
        Backing, MapFlags, MapRequest, Mapping, MappingInfo, MappingTable, Protection, Sharing,
        SyncFlags,
    },
};

/// A backing-store call queued under the mapping lock.
enum StoreOp {
    Register {
        store: Arc<dyn BackingStore>,
        offset: usize,
        length: usize,
    },
    SyncRegion {
        store: Arc<dyn BackingStore>,
        virt: VirtualAddress,
        offset: usize,
        length: usize,
    },
    SyncPage {
        store: Arc<dyn BackingStore>,
        virt: VirtualAddress,
        offset: usize,
        length: usize,
    },
    Unmap {
        store: Arc<dyn BackingStore>,
        virt: VirtualAddress,
        offset: usize,
        length: usize,
    },
    /// Drops a removed mapping, and with it a store reference.
    Retire(Mapping),
}

impl StoreOp {
    fn run(self) -> Result<(), VmError> {
        match self {
            Self::Register {
                store,
                offset,
                length,
            } => {
                store.register_mapped_region(offset, length);
                Ok(())
            }
            Self::SyncRegion {
                store,
                virt,
                offset,
                length,
            } => store.sync_region(virt, offset, length),
            Self::SyncPage {
                store,
                virt,
                offset,
                length,
            } => store.sync_page(virt, offset, length),
            Self::Unmap {
                store,
                virt,
                offset,
                length,
            } => {
                store.unmap_region(virt, offset, length);
                Ok(())
            }
            Self::Retire(mapping) => {
                drop(mapping);
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct Deferred(Vec<StoreOp>);

impl Deferred {
    fn push(&mut self, op: StoreOp) {
        self.0.push(op);
    }

    /// Runs every queued call in order and reports the first failure.
    fn run(self) -> Result<(), VmError> {
        let mut result = Ok(());
        for op in self.0 {
            if let Err(error) = op.run() {
                log::warn!("backing store call failed: {}", error);
                result = result.and(Err(error));
            }
        }
        result
    }
}

/// What the fault path needs to know about a mapping once the mapping lock is released.
struct LoadPlan {
    page: VirtualAddress,
    /// The faulting mapping; the frame is only installed while it is still in place.
    generation: u64,
    flags: PageFlags,
    sharing: Sharing,
    source: Option<(Arc<dyn BackingStore>, usize)>,
    /// Bytes of the page covered by the mapping.
    length: usize,
}

/// The user half of a process, plus the shared kernel half.
pub struct AddressSpace {
    page_table: spin::Mutex<PageDirectory>,
    maps: spin::Mutex<MappingTable>,
    frames: &'static dyn FrameAllocator,
    layout: UserLayout,
}

impl AddressSpace {
    /// Creates an empty address space sharing the kernel half.
    pub fn new() -> Result<Self, VmError> {
        let context = KernelContext::current();
        let layout = context.layout();
        Ok(Self {
            page_table: spin::Mutex::new(context.new_user_directory()?),
            maps: spin::Mutex::new(MappingTable::new(&layout)),
            frames: context.frames(),
            layout,
        })
    }

    pub fn layout(&self) -> UserLayout {
        self.layout
    }

    /// Runs `f` with the page-table lock held and interrupts disabled.
    ///
    /// `f` must not call back into this address space.
    pub fn with_page_table<R>(&self, f: impl FnOnce(&mut PageDirectory) -> R) -> R {
        arch::without_interrupts(|| f(&mut self.page_table.lock()))
    }

    /// Looks up the translation of the page containing `virt`.
    pub fn get_mapping(&self, virt: VirtualAddress) -> Translation {
        self.with_page_table(|dir| dir.get_mapping(virt))
    }

    /// Installs a translation directly, bypassing the mapping table.
    ///
    /// Returns the frame previously mapped there. The caller owns both frames.
    pub fn set_mapping(&self, virt: VirtualAddress, frame: Frame, flags: PageFlags) -> Option<Frame> {
        self.with_page_table(|dir| dir.set_mapping(virt, frame, flags))
    }

    /// Changes the attributes of a resident page. Returns None if the page is absent.
    pub fn set_attributes(&self, virt: VirtualAddress, flags: PageFlags) -> Option<PageFlags> {
        self.with_page_table(|dir| dir.set_attributes(virt, flags))
    }

    /// Number of user pages currently backed by a frame.
    pub fn resident_pages(&self) -> usize {
        self.with_page_table(|dir| dir.user_pages().len())
    }

    /// Creates a mapping and returns its start address.
    ///
    /// Nothing is loaded: pages arrive on first access. A fixed request first unmaps whatever
    /// overlaps the target range.
    pub fn establish(&self, request: MapRequest) -> Result<VirtualAddress, VmError> {
        let MapRequest {
            backing,
            hint,
            protection,
            flags,
            offset,
            length,
        } = request;

        if length == 0 {
            return Err(VmError::InvalidArgument);
        }
        let sharing = match (
            flags.contains(MapFlags::SHARED),
            flags.contains(MapFlags::PRIVATE),
        ) {
            (true, false) => Sharing::Shared,
            (false, true) => Sharing::Private,
            _ => return Err(VmError::InvalidArgument),
        };
        let backing = if flags.contains(MapFlags::ANONYMOUS) {
            if sharing == Sharing::Shared {
                return Err(VmError::InvalidArgument);
            }
            None
        } else {
            let store = backing.ok_or(VmError::InvalidArgument)?;
            if offset % PAGE_SIZE != 0 || offset >= store.length() {
                return Err(VmError::InvalidArgument);
            }
            Some(Backing { store, offset })
        };
        let span = length
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(VmError::OutOfMemory)?;

        let mut deferred = Deferred::default();
        let result = {
            let mut maps = self.maps.lock();
            self.place(&mut maps, hint, flags.contains(MapFlags::FIXED), span, &mut deferred)
                .map(|(virt, range)| {
                    let mapping = Mapping {
                        virt,
                        length,
                        protection,
                        sharing,
                        backing,
                        range,
                        generation: maps.stamp(),
                    };
                    self.install_mapping(&mut maps, mapping, &mut deferred);
                    virt
                })
        };

        // Write-back failures of replaced mappings do not fail the new one; they are logged.
        let _ = deferred.run();
        result
    }

    /// Chooses the start address for a new mapping of `span` bytes and claims its range.
    fn place(
        &self,
        maps: &mut MappingTable,
        hint: Option<VirtualAddress>,
        fixed: bool,
        span: usize,
        deferred: &mut Deferred,
    ) -> Result<(VirtualAddress, Option<VirtualRange>), VmError> {
        if fixed {
            let virt = hint
                .filter(|&virt| virt.is_aligned(PAGE_SIZE) && self.layout.contains(virt, span))
                .ok_or(VmError::OutOfMemory)?;
            self.unmap_locked(maps, virt, span, deferred);
            return Ok((virt, Self::reserve_window(maps, virt, span)?));
        }

        if let Some(virt) = hint.filter(|&virt| {
            virt.is_aligned(PAGE_SIZE)
                && self.layout.contains(virt, span)
                && !maps.overlaps(virt, virt + span)
        }) {
            return Ok((virt, Self::reserve_window(maps, virt, span)?));
        }

        let range = maps
            .ranges
            .allocate(span / PAGE_SIZE)
            .ok_or(VmError::OutOfMemory)?;
        Ok((range.start(), Some(range)))
    }

    /// Claims the part of `[virt, virt + span)` that falls inside the mmap window.
    fn reserve_window(
        maps: &mut MappingTable,
        virt: VirtualAddress,
        span: usize,
    ) -> Result<Option<VirtualRange>, VmError> {
        let window = maps.ranges.window();
        let start = virt.max(window.start());
        let end = (virt + span).min(window.end());
        if start >= end {
            return Ok(None);
        }

        let range = VirtualRange::new(start, (end - start) / PAGE_SIZE);
        if maps.ranges.reserve(range) {
            Ok(Some(range))
        } else {
            Err(VmError::OutOfMemory)
        }
    }

    fn install_mapping(&self, maps: &mut MappingTable, mapping: Mapping, deferred: &mut Deferred) {
        // Translations left behind in the range by direct `set_mapping` calls belong to nobody.
        self.with_page_table(|dir| {
            for page in mapping.pages() {
                if let Some(stale) = dir.unmap(page) {
                    self.frames.free_frame(stale);
                }
            }
        });

        if let (Sharing::Shared, Some(backing)) = (mapping.sharing, &mapping.backing) {
            deferred.push(StoreOp::Register {
                store: backing.store.clone(),
                offset: backing.offset,
                length: mapping.length,
            });
        }

        log::debug!(
            "mapped {:#x} bytes at {} ({:?}, {:?})",
            mapping.length,
            mapping.virt,
            mapping.sharing,
            mapping.protection
        );
        maps.insert(mapping);
    }

    /// Removes the mapping starting at `base` and releases everything it holds.
    pub fn disestablish(&self, base: VirtualAddress) -> Result<(), VmError> {
        let mut deferred = Deferred::default();
        {
            let mut maps = self.maps.lock();
            let mapping = maps.remove(base).ok_or(VmError::NotFound)?;
            self.retire(&mut maps, mapping, &mut deferred);
        }
        deferred.run()
    }

    /// Releases the pages, range and store registration of a mapping already removed from
    /// the table.
    fn retire(&self, maps: &mut MappingTable, mapping: Mapping, deferred: &mut Deferred) {
        let private = !mapping.is_shared();
        self.with_page_table(|dir| {
            for page in mapping.pages() {
                if let Some(frame) = dir.unmap(page) {
                    if private {
                        self.frames.free_frame(frame);
                    }
                }
            }
        });

        if let Some(range) = mapping.range {
            maps.ranges.deallocate(range);
        }

        if let (Sharing::Shared, Some(backing)) = (mapping.sharing, &mapping.backing) {
            if mapping.is_writable() {
                deferred.push(StoreOp::SyncRegion {
                    store: backing.store.clone(),
                    virt: mapping.virt,
                    offset: backing.offset,
                    length: mapping.length,
                });
            }
            deferred.push(StoreOp::Unmap {
                store: backing.store.clone(),
                virt: mapping.virt,
                offset: backing.offset,
                length: mapping.length,
            });
        }

        log::debug!("unmapped {:?}", mapping);
        deferred.push(StoreOp::Retire(mapping));
    }

    /// Unmaps every page in `[start, start + length)`, trimming or splitting the mappings that
    /// cover it. Pages not covered by any mapping are skipped.
    pub fn unmap_range(&self, start: VirtualAddress, length: usize) -> Result<(), VmError> {
        if !start.is_aligned(PAGE_SIZE) || length == 0 {
            return Err(VmError::InvalidArgument);
        }
        let span = length
            .checked_next_multiple_of(PAGE_SIZE)
            .filter(|&span| self.layout.contains(start, span))
            .ok_or(VmError::InvalidArgument)?;

        let mut deferred = Deferred::default();
        self.unmap_locked(&mut self.maps.lock(), start, span, &mut deferred);
        deferred.run()
    }

    fn unmap_locked(
        &self,
        maps: &mut MappingTable,
        start: VirtualAddress,
        span: usize,
        deferred: &mut Deferred,
    ) {
        for page in (0..span / PAGE_SIZE).map(|index| start + index * PAGE_SIZE) {
            let Some(base) = maps.find(page).map(|mapping| mapping.virt) else {
                continue;
            };
            let Some(mut mapping) = maps.remove(base) else {
                continue;
            };
            self.disengage_page(&mapping, page, deferred);

            let (before, after) = match mapping.range {
                Some(range) if range.contains(page) => maps.ranges.release_page(range, page),
                Some(range) if range.start() > page => (None, Some(range)),
                range => (range, None),
            };

            let index = (page - mapping.virt) / PAGE_SIZE;
            if index == 0 {
                mapping.virt = page + PAGE_SIZE;
                mapping.length = mapping.length.saturating_sub(PAGE_SIZE);
                if let Some(backing) = &mut mapping.backing {
                    backing.offset += PAGE_SIZE;
                }
                mapping.range = after;
            } else if index == mapping.span() / PAGE_SIZE - 1 {
                mapping.length = index * PAGE_SIZE;
                mapping.range = before;
            } else {
                let skip = (index + 1) * PAGE_SIZE;
                let mut tail = mapping.clone();
                tail.virt = mapping.virt + skip;
                tail.length = mapping.length - skip;
                if let Some(backing) = &mut tail.backing {
                    backing.offset += skip;
                }
                tail.range = after;
                mapping.length = index * PAGE_SIZE;
                mapping.range = before;

                log::debug!("split mapping at {}: {} remains", page, tail.virt);
                maps.insert(tail);
            }

            if mapping.length == 0 {
                deferred.push(StoreOp::Retire(mapping));
            } else {
                maps.insert(mapping);
            }
        }
    }

    /// Drops the translation of one page of `mapping`.
    fn disengage_page(&self, mapping: &Mapping, page: VirtualAddress, deferred: &mut Deferred) {
        let frame = self.with_page_table(|dir| dir.unmap(page));
        match (&mapping.backing, mapping.sharing) {
            (Some(backing), Sharing::Shared) => {
                let offset = mapping.offset_of(page);
                let length = mapping.page_length(page);
                if mapping.is_writable() && frame.is_some() {
                    deferred.push(StoreOp::SyncPage {
                        store: backing.store.clone(),
                        virt: page,
                        offset,
                        length,
                    });
                }
                deferred.push(StoreOp::Unmap {
                    store: backing.store.clone(),
                    virt: page,
                    offset,
                    length,
                });
            }
            _ => {
                if let Some(frame) = frame {
                    self.frames.free_frame(frame);
                }
            }
        }
    }

    /// Writes back the resident pages of shared writable mappings in `[start, start + length)`.
    ///
    /// Fails with [`VmError::NotFound`] before writing anything if part of the range is not
    /// mapped.
    pub fn sync(&self, start: VirtualAddress, length: usize, flags: SyncFlags) -> Result<(), VmError> {
        if !start.is_aligned(PAGE_SIZE) || flags.contains(SyncFlags::ASYNC | SyncFlags::SYNC) {
            return Err(VmError::InvalidArgument);
        }
        let end = start
            .as_usize()
            .checked_add(length)
            .ok_or(VmError::InvalidArgument)?;

        let mut deferred = Deferred::default();
        {
            let maps = self.maps.lock();
            let mut cursor = start;
            while cursor.as_usize() < end {
                let mapping = maps.find(cursor).ok_or(VmError::NotFound)?;
                let chunk_end = mapping.end().as_usize().min(end);
                self.sync_mapping(mapping, cursor, chunk_end - cursor.as_usize(), &mut deferred);
                cursor = VirtualAddress::new(chunk_end);
            }
        }
        deferred.run()
    }

    /// Queues write-back of the resident pages of `mapping` within `[start, start + length)`.
    fn sync_mapping(
        &self,
        mapping: &Mapping,
        start: VirtualAddress,
        length: usize,
        deferred: &mut Deferred,
    ) {
        let Some(backing) = mapping
            .backing
            .as_ref()
            .filter(|_| mapping.is_shared() && mapping.is_writable())
        else {
            return;
        };

        let end = start + length;
        let mut page = start;
        while page < end {
            if self.get_mapping(page) != Translation::Absent {
                deferred.push(StoreOp::SyncPage {
                    store: backing.store.clone(),
                    virt: page,
                    offset: mapping.offset_of(page),
                    length: PAGE_SIZE.min(end - page).min(mapping.page_length(page)),
                });
            }
            page = page + PAGE_SIZE;
        }
    }

    /// Removes every mapping, as on exit or exec.
    ///
    /// # Panics
    ///
    /// Panics if a mapping or an allocated range survives the teardown.
    pub fn destroy_all(&self) -> Result<(), VmError> {
        let mut deferred = Deferred::default();
        {
            let mut maps = self.maps.lock();
            for (_, mapping) in maps.take_all() {
                self.retire(&mut maps, mapping, &mut deferred);
            }
            assert!(
                maps.is_empty() && maps.ranges.used_pages() == 0,
                "address space teardown left mappings behind"
            );
        }
        deferred.run()
    }

    /// Builds the address space of a forked child.
    ///
    /// Pages of shared mappings are shared with the child; every other resident page is
    /// copied. The page tables are cloned before the mapping table.
    pub fn fork(&self) -> Result<AddressSpace, VmError> {
        let mut deferred = Deferred::default();
        let child = {
            let maps = self.maps.lock();
            let directory = self.with_page_table(|dir| {
                dir.duplicate(&|virt| maps.find(virt).is_some_and(Mapping::is_shared))
            })?;

            let child_maps = maps.clone();
            for mapping in child_maps.iter() {
                if let (Sharing::Shared, Some(backing)) = (mapping.sharing, &mapping.backing) {
                    deferred.push(StoreOp::Register {
                        store: backing.store.clone(),
                        offset: backing.offset,
                        length: mapping.length,
                    });
                }
            }

            AddressSpace {
                page_table: spin::Mutex::new(directory),
                maps: spin::Mutex::new(child_maps),
                frames: self.frames,
                layout: self.layout,
            }
        };
        deferred.run()?;

        log::debug!("forked address space with {} mappings", child.mapping_count());
        Ok(child)
    }

    /// Loads the page behind a fault, or reports why it cannot be loaded.
    pub fn resolve_fault(&self, fault: &PageFault) -> Result<(), VmError> {
        if fault.cause.contains(FaultCause::RESERVED_BIT) {
            return Err(VmError::PermissionDenied);
        }

        let page = fault.address.align_down(PAGE_SIZE);
        let plan = {
            let maps = self.maps.lock();
            let mapping = maps.find(fault.address).ok_or(VmError::NotFound)?;
            Self::check_access(mapping.protection, fault.cause)?;

            let flags = mapping.leaf_flags();
            let resident = self.with_page_table(|dir| match dir.get_mapping(page) {
                Translation::Present { flags: current, .. } => {
                    if !current.permits(flags) {
                        dir.set_attributes(page, flags);
                    }
                    true
                }
                Translation::Absent => false,
            });
            if resident {
                return Ok(());
            }

            LoadPlan {
                page,
                generation: mapping.generation,
                flags,
                sharing: mapping.sharing,
                source: mapping
                    .backing
                    .as_ref()
                    .map(|backing| (backing.store.clone(), mapping.offset_of(page))),
                length: mapping.page_length(page),
            }
        };

        #[cfg(feature = "detailed-logging")]
        log::trace!("loading {} for fault at {} ({:?})", page, fault.address, fault.cause);

        self.load(plan)
    }

    fn check_access(protection: Protection, cause: FaultCause) -> Result<(), VmError> {
        let required = if cause.contains(FaultCause::WRITE) {
            Protection::WRITE
        } else if cause.contains(FaultCause::INSTRUCTION_FETCH) {
            Protection::EXEC
        } else {
            Protection::READ
        };
        if protection.contains(required) {
            Ok(())
        } else {
            Err(VmError::PermissionDenied)
        }
    }

    fn load(&self, plan: LoadPlan) -> Result<(), VmError> {
        let LoadPlan {
            page,
            generation,
            flags,
            sharing,
            source,
            length,
        } = plan;

        if let (Sharing::Shared, Some((store, offset))) = (sharing, &source) {
            let frame = store.populate_shared_page(page, *offset, true, flags)?;
            return self.install_page(page, generation, frame, flags, false);
        }

        let frame = self.frames.allocate_frame().ok_or(VmError::OutOfMemory)?;
        // SAFETY: The frame is fresh and not mapped anywhere yet.
        let bytes = unsafe { frame.bytes_mut() };
        bytes.fill(0);
        if let Some((store, offset)) = &source {
            if let Err(error) = store.populate_private_page(page, *offset, flags, &mut bytes[..length]) {
                self.frames.free_frame(frame);
                return Err(error);
            }
        }
        self.install_page(page, generation, frame, flags, true)
    }

    /// Maps a loaded frame unless the mapping it was loaded for is gone or another thread got
    /// there first. The mapping counts as gone when the page is now covered by a different
    /// one, even at the same address. An `owned` frame that ends up unused is freed.
    fn install_page(
        &self,
        page: VirtualAddress,
        generation: u64,
        frame: Frame,
        flags: PageFlags,
        owned: bool,
    ) -> Result<(), VmError> {
        let maps = self.maps.lock();
        if maps.find(page).is_none_or(|mapping| mapping.generation != generation) {
            if owned {
                self.frames.free_frame(frame);
            }
            return Err(VmError::NotFound);
        }

        let installed = self.with_page_table(|dir| match dir.get_mapping(page) {
            Translation::Absent => {
                dir.set_mapping(page, frame, flags);
                true
            }
            Translation::Present { .. } => false,
        });
        drop(maps);

        if !installed && owned {
            self.frames.free_frame(frame);
        }
        Ok(())
    }

    /// Backs the page containing `address` with a zeroed, writable frame that belongs to no
    /// mapping. This is how a task heap or stack grows on first touch.
    ///
    /// A page that is covered by a mapping, or already resident, is left alone. Frames
    /// installed here are copied by [`AddressSpace::fork`] and freed when the address space is
    /// dropped.
    pub fn map_zero_page(&self, address: VirtualAddress) -> Result<(), VmError> {
        if !self.layout.contains(address, 1) {
            return Err(VmError::NotFound);
        }
        let page = address.align_down(PAGE_SIZE);

        let maps = self.maps.lock();
        if maps.find(page).is_some() {
            return Ok(());
        }
        let frame = self.frames.allocate_frame().ok_or(VmError::OutOfMemory)?;
        // SAFETY: The frame is fresh and not mapped anywhere yet.
        unsafe { frame.zero() };

        let mut flags = PageFlags::empty();
        flags.set_user(true);
        flags.set_writable(true);
        flags.set_no_execute(true);
        let installed = self.with_page_table(|dir| match dir.get_mapping(page) {
            Translation::Absent => {
                dir.set_mapping(page, frame, flags);
                true
            }
            Translation::Present { .. } => false,
        });
        drop(maps);

        if !installed {
            self.frames.free_frame(frame);
        }
        Ok(())
    }

    pub fn mapping_count(&self) -> usize {
        self.maps.lock().len()
    }

    /// Returns the mapping covering `virt`, if any.
    pub fn mapping_at(&self, virt: VirtualAddress) -> Option<MappingInfo> {
        self.maps.lock().find(virt).map(Mapping::info)
    }

    /// Returns every mapping in address order.
    pub fn mappings(&self) -> Vec<MappingInfo> {
        self.maps.lock().iter().map(Mapping::info).collect()
    }

    /// Returns the ranges claimed from the mmap window, in address order.
    pub fn virtual_ranges(&self) -> Vec<VirtualRange> {
        self.maps.lock().ranges.allocated().collect()
    }

    pub fn used_virtual_pages(&self) -> usize {
        self.maps.lock().ranges.used_pages()
    }

    /// Loads this address space into the MMU of the current CPU.
    ///
    /// # Safety
    /// The address space must not be dropped while it is loaded on any CPU.
    pub unsafe fn activate(&self) {
        let dir = self.page_table.lock();
        // SAFETY: Forwarded from the caller.
        unsafe { dir.activate() };
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if let Err(error) = self.destroy_all() {
            log::warn!("write-back failed while tearing down an address space: {}", error);
        }
        self.page_table.get_mut().clear_user_pages(&|_| false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        EmulatedMemory, testing,
        testing::{MockStore, StoreCall, pattern},
    };

    fn setup() -> (&'static EmulatedMemory, AddressSpace) {
        let memory = testing::setup(512);
        (memory, AddressSpace::new().unwrap())
    }

    fn user_fault(address: VirtualAddress, write: bool) -> PageFault {
        PageFault {
            address,
            instruction_pointer: 0x1000,
            cause: FaultCause::classify(false, write, true, false, false),
        }
    }

    fn byte_at(space: &AddressSpace, virt: VirtualAddress) -> u8 {
        let frame = space.get_mapping(virt).frame().unwrap();
        unsafe { frame.bytes_mut()[virt.page_offset()] }
    }

    fn rw() -> Protection {
        Protection::READ | Protection::WRITE
    }

    #[test]
    fn anonymous_mapping_round_trip() {
        let (memory, space) = setup();
        let virt = space.establish(MapRequest::anonymous(3 * PAGE_SIZE, rw())).unwrap();

        assert_eq!(space.used_virtual_pages(), 3);
        assert_eq!(space.resident_pages(), 0);

        let target = virt + PAGE_SIZE + 5;
        space.resolve_fault(&user_fault(target, true)).unwrap();

        assert_eq!(space.resident_pages(), 1);
        assert_eq!(byte_at(&space, target), 0);
        let frame = space.get_mapping(target).frame().unwrap();
        let Translation::Present { flags, .. } = space.get_mapping(target) else {
            unreachable!()
        };
        assert!(flags.is_user() && flags.is_writable() && flags.is_no_execute());

        space.disestablish(virt).unwrap();

        assert!(!memory.is_allocated(frame));
        assert_eq!(space.get_mapping(target), Translation::Absent);
        assert_eq!(space.used_virtual_pages(), 0);
        assert_eq!(space.mapping_count(), 0);
    }

    #[test]
    fn shared_mapping_with_partial_final_page() {
        let (_memory, space) = setup();
        let store = MockStore::new(PAGE_SIZE + 10);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, PAGE_SIZE + 10, rw(), Sharing::Shared))
            .unwrap();
        assert_eq!(
            store.calls(),
            [StoreCall::Register { offset: 0, length: PAGE_SIZE + 10 }]
        );
        store.clear_calls();

        let second = virt + PAGE_SIZE;
        space.resolve_fault(&user_fault(second + 3, true)).unwrap();

        assert_eq!(
            store.calls(),
            [StoreCall::PopulateShared { virt: second, offset: PAGE_SIZE, populate: true }]
        );
        assert_eq!(space.get_mapping(second).frame(), store.shared_frame(PAGE_SIZE));
        assert_eq!(byte_at(&space, second + 3), pattern(PAGE_SIZE + 3));
        assert_eq!(byte_at(&space, second + 10), 0);
        store.clear_calls();

        space.sync(virt, PAGE_SIZE + 10, SyncFlags::SYNC).unwrap();
        assert_eq!(
            store.calls(),
            [StoreCall::SyncPage { virt: second, offset: PAGE_SIZE, length: 10 }]
        );
    }

    #[test]
    fn private_file_mapping_clamps_final_page() {
        let (_memory, space) = setup();
        let store = MockStore::new(3 * PAGE_SIZE + 10);
        let virt = space
            .establish(MapRequest::file(store.clone(), PAGE_SIZE, 2 * PAGE_SIZE + 10, rw(), Sharing::Private))
            .unwrap();
        assert!(store.calls().is_empty());

        let last = virt + 2 * PAGE_SIZE;
        space.resolve_fault(&user_fault(last, false)).unwrap();

        assert_eq!(
            store.calls(),
            [StoreCall::PopulatePrivate { virt: last, offset: 3 * PAGE_SIZE, length: 10 }]
        );
        assert_eq!(byte_at(&space, last + 9), pattern(3 * PAGE_SIZE + 9));
        assert_eq!(byte_at(&space, last + 10), 0);
        assert_eq!(store.shared_frame(3 * PAGE_SIZE), None);
    }

    #[test]
    fn establish_then_disestablish_restores_the_allocator() {
        let (_memory, space) = setup();
        space.establish(MapRequest::anonymous(2 * PAGE_SIZE, rw())).unwrap();
        let before = space.maps.lock().ranges.clone();

        let virt = space.establish(MapRequest::anonymous(5 * PAGE_SIZE + 1, rw())).unwrap();
        assert_eq!(space.used_virtual_pages(), 8);
        space.disestablish(virt).unwrap();

        assert_eq!(space.maps.lock().ranges, before);
    }

    #[test]
    fn unmapping_an_interior_page_splits_the_mapping() {
        let (_memory, space) = setup();
        let store = MockStore::new(4 * PAGE_SIZE);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, 4 * PAGE_SIZE, rw(), Sharing::Private))
            .unwrap();
        assert_eq!(Arc::strong_count(&store), 2);

        space.unmap_range(virt + PAGE_SIZE, PAGE_SIZE).unwrap();

        let mappings = space.mappings();
        assert_eq!(mappings.len(), 2);
        assert_eq!((mappings[0].start, mappings[0].length), (virt, PAGE_SIZE));
        assert_eq!(mappings[0].offset, Some(0));
        assert_eq!((mappings[1].start, mappings[1].length), (virt + 2 * PAGE_SIZE, 2 * PAGE_SIZE));
        assert_eq!(mappings[1].offset, Some(2 * PAGE_SIZE));
        assert_eq!(Arc::strong_count(&store), 3);
        assert_eq!(
            space.virtual_ranges(),
            [VirtualRange::new(virt, 1), VirtualRange::new(virt + 2 * PAGE_SIZE, 2)]
        );
        assert!(space.mapping_at(virt + PAGE_SIZE).is_none());

        space.unmap_range(virt, 4 * PAGE_SIZE).unwrap();

        assert_eq!(space.mapping_count(), 0);
        assert_eq!(space.used_virtual_pages(), 0);
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[test]
    fn unmapping_the_ends_trims_the_mapping() {
        let (memory, space) = setup();
        let virt = space.establish(MapRequest::anonymous(3 * PAGE_SIZE, rw())).unwrap();
        space.resolve_fault(&user_fault(virt, true)).unwrap();
        let first = space.get_mapping(virt).frame().unwrap();

        space.unmap_range(virt, PAGE_SIZE).unwrap();
        assert!(!memory.is_allocated(first));
        let info = space.mapping_at(virt + PAGE_SIZE).unwrap();
        assert_eq!((info.start, info.length), (virt + PAGE_SIZE, 2 * PAGE_SIZE));

        space.unmap_range(virt + 2 * PAGE_SIZE, 1).unwrap();
        let info = space.mapping_at(virt + PAGE_SIZE).unwrap();
        assert_eq!((info.start, info.length), (virt + PAGE_SIZE, PAGE_SIZE));
        assert_eq!(space.virtual_ranges(), [VirtualRange::new(virt + PAGE_SIZE, 1)]);
    }

    #[test]
    fn unmapping_a_resident_shared_page_writes_it_back() {
        let (_memory, space) = setup();
        let store = MockStore::new(2 * PAGE_SIZE);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, 2 * PAGE_SIZE, rw(), Sharing::Shared))
            .unwrap();
        space.resolve_fault(&user_fault(virt + PAGE_SIZE, true)).unwrap();
        let frame = store.shared_frame(PAGE_SIZE).unwrap();
        store.clear_calls();

        space.unmap_range(virt, 2 * PAGE_SIZE).unwrap();

        assert_eq!(
            store.calls(),
            [
                StoreCall::Unmap { virt, offset: 0, length: PAGE_SIZE },
                StoreCall::SyncPage { virt: virt + PAGE_SIZE, offset: PAGE_SIZE, length: PAGE_SIZE },
                StoreCall::Unmap { virt: virt + PAGE_SIZE, offset: PAGE_SIZE, length: PAGE_SIZE },
            ]
        );
        assert_eq!(store.shared_frame(PAGE_SIZE), Some(frame));
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[test]
    fn disestablish_shared_writable_syncs_then_unmaps() {
        let (memory, space) = setup();
        let store = MockStore::new(2 * PAGE_SIZE);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, 2 * PAGE_SIZE, rw(), Sharing::Shared))
            .unwrap();
        space.resolve_fault(&user_fault(virt, false)).unwrap();
        let frame = store.shared_frame(0).unwrap();
        store.clear_calls();

        space.disestablish(virt).unwrap();

        assert_eq!(
            store.calls(),
            [
                StoreCall::SyncRegion { virt, offset: 0, length: 2 * PAGE_SIZE },
                StoreCall::Unmap { virt, offset: 0, length: 2 * PAGE_SIZE },
            ]
        );
        assert!(memory.is_allocated(frame));
        assert_eq!(space.disestablish(virt), Err(VmError::NotFound));
    }

    #[test]
    fn faults_outside_any_mapping_are_rejected() {
        let (_memory, space) = setup();
        let result = space.resolve_fault(&user_fault(VirtualAddress::new(0x3000), false));
        assert_eq!(result, Err(VmError::NotFound));
    }

    #[test]
    fn faults_must_respect_protection() {
        let (_memory, space) = setup();
        let virt = space.establish(MapRequest::anonymous(PAGE_SIZE, Protection::READ)).unwrap();

        assert_eq!(
            space.resolve_fault(&user_fault(virt, true)),
            Err(VmError::PermissionDenied)
        );
        let fetch = PageFault {
            address: virt,
            instruction_pointer: virt.as_usize(),
            cause: FaultCause::classify(false, false, true, false, true),
        };
        assert_eq!(space.resolve_fault(&fetch), Err(VmError::PermissionDenied));
        let reserved = PageFault {
            cause: FaultCause::classify(true, false, true, true, false),
            ..user_fault(virt, false)
        };
        assert_eq!(space.resolve_fault(&reserved), Err(VmError::PermissionDenied));

        assert_eq!(space.resolve_fault(&user_fault(virt, false)), Ok(()));
        assert_eq!(space.resident_pages(), 1);
    }

    #[test]
    fn fault_on_resident_page_restores_attributes() {
        let (_memory, space) = setup();
        let virt = space.establish(MapRequest::anonymous(PAGE_SIZE, rw())).unwrap();
        space.resolve_fault(&user_fault(virt, false)).unwrap();
        let frame = space.get_mapping(virt).frame().unwrap();

        let mut read_only = PageFlags::empty();
        read_only.set_user(true);
        space.set_attributes(virt, read_only);

        space.resolve_fault(&user_fault(virt, true)).unwrap();
        match space.get_mapping(virt) {
            Translation::Present { frame: mapped, flags } => {
                assert_eq!(mapped, frame);
                assert!(flags.is_writable());
            }
            Translation::Absent => panic!("page should stay resident"),
        }
    }

    #[test]
    fn failed_population_releases_the_frame() {
        let (memory, space) = setup();
        let store = MockStore::new(PAGE_SIZE);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, PAGE_SIZE, rw(), Sharing::Private))
            .unwrap();
        store.fail_with(VmError::InvalidArgument);
        let before = memory.allocated_frames();

        assert_eq!(
            space.resolve_fault(&user_fault(virt, false)),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(memory.allocated_frames(), before);
        assert_eq!(space.get_mapping(virt), Translation::Absent);
    }

    /// An address space the store can call back into while a page is being read in.
    fn leaked_space() -> (&'static EmulatedMemory, &'static AddressSpace) {
        let (memory, space) = setup();
        (memory, alloc::boxed::Box::leak(alloc::boxed::Box::new(space)))
    }

    #[test]
    fn load_racing_a_remap_installs_nothing() {
        let (memory, space) = leaked_space();
        let store = MockStore::new(PAGE_SIZE);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, PAGE_SIZE, rw(), Sharing::Private))
            .unwrap();
        store.during_next_populate(move || {
            space.unmap_range(virt, PAGE_SIZE).unwrap();
            space
                .establish(MapRequest::anonymous(PAGE_SIZE, Protection::READ).fixed(virt))
                .unwrap();
        });
        let before = memory.allocated_frames();

        assert_eq!(
            space.resolve_fault(&user_fault(virt, true)),
            Err(VmError::NotFound)
        );
        assert_eq!(space.get_mapping(virt), Translation::Absent);
        assert_eq!(memory.allocated_frames(), before);

        let info = space.mapping_at(virt).unwrap();
        assert_eq!((info.protection, info.offset), (Protection::READ, None));
        space.resolve_fault(&user_fault(virt, false)).unwrap();
        assert_eq!(byte_at(&space, virt), 0);
        let Translation::Present { flags, .. } = space.get_mapping(virt) else {
            unreachable!()
        };
        assert!(!flags.is_writable());
    }

    #[test]
    fn load_racing_a_removal_frees_the_frame() {
        let (memory, space) = leaked_space();
        let store = MockStore::new(PAGE_SIZE);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, PAGE_SIZE, rw(), Sharing::Private))
            .unwrap();
        store.during_next_populate(move || space.disestablish(virt).unwrap());
        let before = memory.allocated_frames();

        assert_eq!(
            space.resolve_fault(&user_fault(virt, false)),
            Err(VmError::NotFound)
        );
        assert_eq!(memory.allocated_frames(), before);
        assert_eq!(space.get_mapping(virt), Translation::Absent);
        assert_eq!(space.mapping_count(), 0);
    }

    #[test]
    fn losing_a_fault_race_frees_the_extra_frame() {
        let (memory, space) = leaked_space();
        let store = MockStore::new(2 * PAGE_SIZE);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, 2 * PAGE_SIZE, rw(), Sharing::Private))
            .unwrap();
        // Builds the tables, so only data frames are counted below.
        space.resolve_fault(&user_fault(virt + PAGE_SIZE, false)).unwrap();
        store.during_next_populate(move || {
            space.resolve_fault(&user_fault(virt, false)).unwrap();
        });
        let before = memory.allocated_frames();

        space.resolve_fault(&user_fault(virt, true)).unwrap();

        assert_eq!(memory.allocated_frames(), before + 1);
        assert_eq!(space.resident_pages(), 2);
        assert_eq!(byte_at(&space, virt + 7), pattern(7));
    }

    #[test]
    fn zero_pages_live_outside_the_mapping_table() {
        let (memory, space) = setup();
        let heap = VirtualAddress::new(0x8000);

        space.map_zero_page(heap + 0x10).unwrap();
        space.map_zero_page(heap).unwrap();

        let frame = space.get_mapping(heap).frame().unwrap();
        assert_eq!(space.resident_pages(), 1);
        assert_eq!(space.mapping_count(), 0);
        assert_eq!(byte_at(&space, heap + 0x10), 0);
        let Translation::Present { flags, .. } = space.get_mapping(heap) else {
            unreachable!()
        };
        assert!(flags.is_user() && flags.is_writable() && flags.is_no_execute());

        let child = space.fork().unwrap();
        let copy = child.get_mapping(heap).frame().unwrap();
        assert_ne!(copy, frame);

        drop(child);
        drop(space);
        assert!(!memory.is_allocated(frame));
        assert!(!memory.is_allocated(copy));
    }

    #[test]
    fn zero_pages_defer_to_mappings() {
        let (memory, space) = setup();
        let virt = space.establish(MapRequest::anonymous(PAGE_SIZE, Protection::READ)).unwrap();
        let before = memory.allocated_frames();

        space.map_zero_page(virt).unwrap();

        assert_eq!(space.get_mapping(virt), Translation::Absent);
        assert_eq!(memory.allocated_frames(), before);
        assert_eq!(
            space.map_zero_page(VirtualAddress::new(0)),
            Err(VmError::NotFound)
        );
    }

    #[test]
    fn private_fault_without_memory_fails() {
        let (memory, space) = setup();
        let virt = space.establish(MapRequest::anonymous(PAGE_SIZE, rw())).unwrap();
        while memory.allocate_frame().is_some() {}

        assert_eq!(
            space.resolve_fault(&user_fault(virt, true)),
            Err(VmError::OutOfMemory)
        );
    }

    #[test]
    fn establish_rejects_invalid_requests() {
        let (_memory, space) = setup();
        let store = MockStore::new(2 * PAGE_SIZE);

        assert_eq!(
            space.establish(MapRequest::anonymous(0, rw())),
            Err(VmError::InvalidArgument)
        );

        let mut both = MapRequest::anonymous(PAGE_SIZE, rw());
        both.flags |= MapFlags::SHARED;
        assert_eq!(space.establish(both), Err(VmError::InvalidArgument));

        let mut shared_anonymous = MapRequest::anonymous(PAGE_SIZE, rw());
        shared_anonymous.flags = MapFlags::SHARED | MapFlags::ANONYMOUS;
        assert_eq!(space.establish(shared_anonymous), Err(VmError::InvalidArgument));

        let beyond = MapRequest::file(store.clone(), 2 * PAGE_SIZE, PAGE_SIZE, rw(), Sharing::Private);
        assert_eq!(space.establish(beyond), Err(VmError::InvalidArgument));

        let unaligned = MapRequest::file(store.clone(), 7, PAGE_SIZE, rw(), Sharing::Private);
        assert_eq!(space.establish(unaligned), Err(VmError::InvalidArgument));

        let mut missing_store = MapRequest::anonymous(PAGE_SIZE, rw());
        missing_store.flags = MapFlags::PRIVATE;
        assert_eq!(space.establish(missing_store), Err(VmError::InvalidArgument));

        assert_eq!(space.mapping_count(), 0);
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[test]
    fn fixed_requests_need_a_valid_location() {
        let (_memory, space) = setup();
        let layout = space.layout();

        let unaligned = MapRequest::anonymous(PAGE_SIZE, rw()).fixed(layout.mmap_start + 8);
        assert_eq!(space.establish(unaligned), Err(VmError::OutOfMemory));

        let outside = MapRequest::anonymous(2 * PAGE_SIZE, rw()).fixed(layout.user_end - PAGE_SIZE);
        assert_eq!(space.establish(outside), Err(VmError::OutOfMemory));

        let mut no_address = MapRequest::anonymous(PAGE_SIZE, rw());
        no_address.flags |= MapFlags::FIXED;
        assert_eq!(space.establish(no_address), Err(VmError::OutOfMemory));
    }

    #[test]
    fn fixed_mapping_replaces_what_it_overlaps() {
        let (memory, space) = setup();
        let virt = space.establish(MapRequest::anonymous(4 * PAGE_SIZE, rw())).unwrap();
        space.resolve_fault(&user_fault(virt + PAGE_SIZE, true)).unwrap();
        let replaced = space.get_mapping(virt + PAGE_SIZE).frame().unwrap();

        let fixed = MapRequest::anonymous(2 * PAGE_SIZE, Protection::READ).fixed(virt + PAGE_SIZE);
        assert_eq!(space.establish(fixed), Ok(virt + PAGE_SIZE));

        assert!(!memory.is_allocated(replaced));
        let starts: Vec<_> = space.mappings().iter().map(|m| (m.start, m.length)).collect();
        assert_eq!(
            starts,
            [
                (virt, PAGE_SIZE),
                (virt + PAGE_SIZE, 2 * PAGE_SIZE),
                (virt + 3 * PAGE_SIZE, PAGE_SIZE),
            ]
        );
        assert_eq!(space.used_virtual_pages(), 4);
        assert_eq!(
            space.mapping_at(virt + 2 * PAGE_SIZE).unwrap().protection,
            Protection::READ
        );
    }

    #[test]
    fn hints_are_honored_only_when_free() {
        let (_memory, space) = setup();
        let layout = space.layout();
        let hint = layout.user_start + 4 * PAGE_SIZE;

        let first = space.establish(MapRequest::anonymous(PAGE_SIZE, rw()).at(hint)).unwrap();
        assert_eq!(first, hint);
        assert_eq!(space.mapping_at(hint).unwrap().range, None);
        assert_eq!(space.used_virtual_pages(), 0);

        let second = space.establish(MapRequest::anonymous(PAGE_SIZE, rw()).at(hint)).unwrap();
        assert_eq!(second, layout.mmap_start);
        assert_eq!(space.used_virtual_pages(), 1);

        let inside = layout.mmap_start + 8 * PAGE_SIZE;
        let third = space.establish(MapRequest::anonymous(PAGE_SIZE, rw()).at(inside)).unwrap();
        assert_eq!(third, inside);
        assert_eq!(space.mapping_at(inside).unwrap().range, Some(VirtualRange::new(inside, 1)));
        assert_eq!(
            space.establish(MapRequest::anonymous(PAGE_SIZE, rw())),
            Ok(layout.mmap_start + PAGE_SIZE)
        );
    }

    #[test]
    fn exhausting_the_mmap_window_fails() {
        let (_memory, space) = setup();
        let window = space.layout().mmap_end - space.layout().mmap_start;

        assert_eq!(
            space.establish(MapRequest::anonymous(window + PAGE_SIZE, rw())),
            Err(VmError::OutOfMemory)
        );
        assert!(space.establish(MapRequest::anonymous(window, rw())).is_ok());
        assert_eq!(
            space.establish(MapRequest::anonymous(PAGE_SIZE, rw())),
            Err(VmError::OutOfMemory)
        );
    }

    #[test]
    fn mappings_never_overlap() {
        let (_memory, space) = setup();
        for length in [PAGE_SIZE, 3 * PAGE_SIZE + 1, 2 * PAGE_SIZE, 10] {
            space.establish(MapRequest::anonymous(length, rw())).unwrap();
        }

        let mappings = space.mappings();
        for pair in mappings.windows(2) {
            let end = pair[0].start + pair[0].length.next_multiple_of(PAGE_SIZE);
            assert!(end <= pair[1].start);
        }
    }

    #[test]
    fn sync_checks_its_arguments() {
        let (_memory, space) = setup();
        let virt = space.establish(MapRequest::anonymous(PAGE_SIZE, rw())).unwrap();

        assert_eq!(
            space.sync(virt, 2 * PAGE_SIZE, SyncFlags::SYNC),
            Err(VmError::NotFound)
        );
        assert_eq!(
            space.sync(virt, PAGE_SIZE, SyncFlags::SYNC | SyncFlags::ASYNC),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(space.sync(virt + 1, 1, SyncFlags::SYNC), Err(VmError::InvalidArgument));
        assert_eq!(space.sync(virt, PAGE_SIZE, SyncFlags::ASYNC), Ok(()));
    }

    #[test]
    fn sync_skips_read_only_and_absent_pages() {
        let (_memory, space) = setup();
        let store = MockStore::new(2 * PAGE_SIZE);
        let virt = space
            .establish(MapRequest::file(store.clone(), 0, 2 * PAGE_SIZE, Protection::READ, Sharing::Shared))
            .unwrap();
        space.resolve_fault(&user_fault(virt, false)).unwrap();
        store.clear_calls();

        space.sync(virt, 2 * PAGE_SIZE, SyncFlags::SYNC).unwrap();
        assert!(store.calls().is_empty());
    }

    #[test]
    fn fork_copies_private_pages_and_shares_shared_ones() {
        let (memory, parent) = setup();
        let store = MockStore::new(2 * PAGE_SIZE);
        let anonymous = parent.establish(MapRequest::anonymous(PAGE_SIZE, rw())).unwrap();
        let shared = parent
            .establish(MapRequest::file(store.clone(), 0, 2 * PAGE_SIZE, rw(), Sharing::Shared))
            .unwrap();
        let private = parent
            .establish(MapRequest::file(store.clone(), 0, PAGE_SIZE, rw(), Sharing::Private))
            .unwrap();
        for virt in [anonymous, shared, private] {
            parent.resolve_fault(&user_fault(virt, true)).unwrap();
        }
        let original = parent.get_mapping(anonymous).frame().unwrap();
        unsafe { original.bytes_mut()[0] = 0x42 };
        store.clear_calls();

        let child = parent.fork().unwrap();

        assert_eq!(child.mappings(), parent.mappings());
        assert_eq!(child.virtual_ranges(), parent.virtual_ranges());
        assert_eq!(Arc::strong_count(&store), 5);
        assert_eq!(
            store.calls(),
            [StoreCall::Register { offset: 0, length: 2 * PAGE_SIZE }]
        );

        let copy = child.get_mapping(anonymous).frame().unwrap();
        assert_ne!(copy, original);
        assert_eq!(byte_at(&child, anonymous), 0x42);
        assert_eq!(child.get_mapping(shared).frame(), parent.get_mapping(shared).frame());
        assert_ne!(child.get_mapping(private).frame(), parent.get_mapping(private).frame());
        assert_eq!(byte_at(&child, private), pattern(0));

        unsafe { copy.bytes_mut()[0] = 0x43 };
        assert_eq!(byte_at(&parent, anonymous), 0x42);

        child.disestablish(anonymous).unwrap();
        child.disestablish(shared).unwrap();
        assert_eq!(child.mapping_count(), 1);
        assert_eq!(parent.mapping_count(), 3);
        assert!(parent.get_mapping(shared).frame().is_some());

        drop(child);
        assert_eq!(Arc::strong_count(&store), 3);
        assert!(!memory.is_allocated(copy));
        assert!(memory.is_allocated(original));
    }

    #[test]
    fn fork_without_memory_leaves_nothing_behind() {
        let (memory, parent) = setup();
        let virt = parent.establish(MapRequest::anonymous(8 * PAGE_SIZE, rw())).unwrap();
        for page in 0..8 {
            parent.resolve_fault(&user_fault(virt + page * PAGE_SIZE, true)).unwrap();
        }

        let mut hoard = Vec::new();
        while memory.allocated_frames() < 511 - 4 {
            hoard.push(memory.allocate_frame().unwrap());
        }
        let before = memory.allocated_frames();

        assert_eq!(parent.fork().err(), Some(VmError::OutOfMemory));
        assert_eq!(memory.allocated_frames(), before);
        assert_eq!(parent.resident_pages(), 8);
    }

    #[test]
    fn destroy_all_releases_everything() {
        let (memory, space) = setup();
        let store = MockStore::new(PAGE_SIZE);
        let before = memory.allocated_frames();
        let virt = space.establish(MapRequest::anonymous(2 * PAGE_SIZE, rw())).unwrap();
        space.resolve_fault(&user_fault(virt, true)).unwrap();
        let file = space
            .establish(MapRequest::file(store.clone(), 0, PAGE_SIZE, rw(), Sharing::Private))
            .unwrap();
        space.resolve_fault(&user_fault(file, true)).unwrap();

        space.destroy_all().unwrap();

        assert_eq!(space.mapping_count(), 0);
        assert_eq!(space.used_virtual_pages(), 0);
        assert_eq!(space.resident_pages(), 0);
        assert_eq!(Arc::strong_count(&store), 1);
        // Only the tables created by the faults remain; they go with the directory.
        assert!(memory.allocated_frames() > before);
    }

    #[test]
    fn activate_loads_the_root() {
        let (_memory, space) = setup();
        let root = space.page_table.lock().root();

        unsafe { space.activate() };
        assert_eq!(arch::active_root(), Some(root.start_address()));
    }

    #[test]
    fn dropping_an_address_space_returns_every_frame() {
        let memory = testing::setup(512);
        let before = memory.allocated_frames();
        {
            let space = AddressSpace::new().unwrap();
            let store = MockStore::new(3 * PAGE_SIZE);
            let virt = space.establish(MapRequest::anonymous(2 * PAGE_SIZE, rw())).unwrap();
            space.resolve_fault(&user_fault(virt + PAGE_SIZE, true)).unwrap();
            let shared = space
                .establish(MapRequest::file(store.clone(), 0, 3 * PAGE_SIZE, rw(), Sharing::Shared))
                .unwrap();
            space.resolve_fault(&user_fault(shared + 2 * PAGE_SIZE, false)).unwrap();

            let stray = memory.allocate_frame().unwrap();
            let mut flags = PageFlags::empty();
            flags.set_user(true);
            space.set_mapping(space.layout().user_start, stray, flags);
        }
        assert_eq!(memory.allocated_frames(), before);
    }
}
