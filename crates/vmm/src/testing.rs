//! Shared fixtures for unit tests.
//!
//! Every test thread gets its own emulated memory, translator and kernel context, so tests can
//! run in parallel without seeing each other's frames.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};

use crate::{
    AddressTranslator, BackingStore, EmulatedMemory, Frame, FrameAllocator, KernelContext,
    PAGE_SIZE, PageFlags, UserLayout, VirtualAddress, VmError, arch,
};

/// Builds the emulated machine for the calling test thread.
pub(crate) fn setup(frame_count: usize) -> &'static EmulatedMemory {
    let memory: &'static EmulatedMemory = Box::leak(Box::new(EmulatedMemory::new(frame_count)));
    AddressTranslator::set_current(AddressTranslator::emulated(memory));
    KernelContext::init(memory, arch::flush_local, UserLayout::default());
    memory
}

/// Byte stored at `offset` of every [`MockStore`].
pub(crate) fn pattern(offset: usize) -> u8 {
    0x80 | (offset % 0x7F) as u8
}

/// One call received by a [`MockStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreCall {
    PopulateShared { virt: VirtualAddress, offset: usize, populate: bool },
    PopulatePrivate { virt: VirtualAddress, offset: usize, length: usize },
    SyncRegion { virt: VirtualAddress, offset: usize, length: usize },
    SyncPage { virt: VirtualAddress, offset: usize, length: usize },
    Register { offset: usize, length: usize },
    Unmap { virt: VirtualAddress, offset: usize, length: usize },
}

/// An in-memory backing store whose content is [`pattern`] up to its length.
///
/// Shared pages are frames owned by the store, released when the last reference drops.
pub(crate) struct MockStore {
    length: usize,
    calls: spin::Mutex<Vec<StoreCall>>,
    pages: spin::Mutex<BTreeMap<usize, Frame>>,
    fail: spin::Mutex<Option<VmError>>,
    during_populate: spin::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MockStore {
    pub(crate) fn new(length: usize) -> Arc<Self> {
        Arc::new(Self {
            length,
            calls: spin::Mutex::new(Vec::new()),
            pages: spin::Mutex::new(BTreeMap::new()),
            fail: spin::Mutex::new(None),
            during_populate: spin::Mutex::new(None),
        })
    }

    pub(crate) fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Makes every later populate call fail with `error`.
    pub(crate) fn fail_with(&self, error: VmError) {
        *self.fail.lock() = Some(error);
    }

    /// Returns the frame caching the shared page at `offset`, if it was populated.
    pub(crate) fn shared_frame(&self, offset: usize) -> Option<Frame> {
        self.pages.lock().get(&offset).copied()
    }

    /// Runs `f` inside the next populate call, while the page is being read in and no
    /// address-space lock is held.
    pub(crate) fn during_next_populate(&self, f: impl FnOnce() + Send + 'static) {
        *self.during_populate.lock() = Some(Box::new(f));
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().push(call);
    }

    fn run_populate_hook(&self) {
        let hook = self.during_populate.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn fill(&self, page: &mut [u8], offset: usize) {
        for (index, byte) in page.iter_mut().enumerate() {
            let position = offset + index;
            *byte = if position < self.length { pattern(position) } else { 0 };
        }
    }
}

impl BackingStore for MockStore {
    fn length(&self) -> usize {
        self.length
    }

    fn populate_shared_page(
        &self,
        virt: VirtualAddress,
        offset: usize,
        populate: bool,
        _flags: PageFlags,
    ) -> Result<Frame, VmError> {
        self.record(StoreCall::PopulateShared { virt, offset, populate });
        self.run_populate_hook();
        if let Some(error) = *self.fail.lock() {
            return Err(error);
        }

        let mut pages = self.pages.lock();
        if let Some(&frame) = pages.get(&offset) {
            return Ok(frame);
        }
        let frame = KernelContext::current()
            .frames()
            .allocate_frame()
            .ok_or(VmError::OutOfMemory)?;
        // SAFETY: The frame is fresh and owned by this store.
        self.fill(unsafe { frame.bytes_mut() }, offset);
        pages.insert(offset, frame);
        Ok(frame)
    }

    fn populate_private_page(
        &self,
        virt: VirtualAddress,
        offset: usize,
        _flags: PageFlags,
        page: &mut [u8],
    ) -> Result<(), VmError> {
        self.record(StoreCall::PopulatePrivate { virt, offset, length: page.len() });
        self.run_populate_hook();
        if let Some(error) = *self.fail.lock() {
            return Err(error);
        }
        assert!(page.len() <= PAGE_SIZE);
        self.fill(page, offset);
        Ok(())
    }

    fn sync_region(&self, virt: VirtualAddress, offset: usize, length: usize) -> Result<(), VmError> {
        self.record(StoreCall::SyncRegion { virt, offset, length });
        Ok(())
    }

    fn sync_page(&self, virt: VirtualAddress, offset: usize, length: usize) -> Result<(), VmError> {
        self.record(StoreCall::SyncPage { virt, offset, length });
        Ok(())
    }

    fn register_mapped_region(&self, offset: usize, length: usize) {
        self.record(StoreCall::Register { offset, length });
    }

    fn unmap_region(&self, virt: VirtualAddress, offset: usize, length: usize) {
        self.record(StoreCall::Unmap { virt, offset, length });
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        let frames = KernelContext::current().frames();
        for (_, frame) in core::mem::take(&mut *self.pages.lock()) {
            frames.free_frame(frame);
        }
    }
}
