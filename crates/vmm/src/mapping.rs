//! Mapping records and the per-address-space mapping table.

use alloc::{collections::BTreeMap, sync::Arc};
use core::fmt;

use bitflags::bitflags;

use crate::{
    BackingStore, PageFlags, VirtualAddress, VirtualRange, VirtualRangeAllocator,
    arch::PAGE_SIZE, context::UserLayout,
};

bitflags! {
    /// Access rights granted by a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Flags of a map request, using the conventional `mmap` bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Writes are visible to every mapper and reach the backing store.
        const SHARED = 0x01;
        /// Writes stay in this address space.
        const PRIVATE = 0x02;
        /// Map exactly at the hint, replacing anything already there.
        const FIXED = 0x10;
        /// No backing store; pages start zero-filled.
        const ANONYMOUS = 0x20;
    }
}

bitflags! {
    /// Flags of a sync request, using the conventional `msync` bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const ASYNC = 0x1;
        const INVALIDATE = 0x2;
        const SYNC = 0x4;
    }
}

/// Whether writes through a mapping are shared with the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    Shared,
    Private,
}

/// A request to establish a mapping.
///
/// The fields are exactly the parameters of an `mmap` call.
#[derive(Clone)]
pub struct MapRequest {
    /// Backing store; ignored for anonymous requests.
    pub backing: Option<Arc<dyn BackingStore>>,
    /// Preferred (or, with [`MapFlags::FIXED`], mandatory) start address.
    pub hint: Option<VirtualAddress>,
    pub protection: Protection,
    pub flags: MapFlags,
    /// Byte offset into the backing store. Must be page-aligned.
    pub offset: usize,
    /// Length in bytes. The final page may be partial.
    pub length: usize,
}

impl MapRequest {
    /// A private anonymous mapping of `length` bytes.
    pub fn anonymous(length: usize, protection: Protection) -> Self {
        Self {
            backing: None,
            hint: None,
            protection,
            flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            offset: 0,
            length,
        }
    }

    /// A mapping of `length` bytes of `store` starting at `offset`.
    pub fn file(
        store: Arc<dyn BackingStore>,
        offset: usize,
        length: usize,
        protection: Protection,
        sharing: Sharing,
    ) -> Self {
        Self {
            backing: Some(store),
            hint: None,
            protection,
            flags: match sharing {
                Sharing::Shared => MapFlags::SHARED,
                Sharing::Private => MapFlags::PRIVATE,
            },
            offset,
            length,
        }
    }

    /// Prefers `hint` as the start address.
    pub fn at(mut self, hint: VirtualAddress) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Requires `address` as the start address.
    pub fn fixed(mut self, address: VirtualAddress) -> Self {
        self.hint = Some(address);
        self.flags |= MapFlags::FIXED;
        self
    }
}

/// A counted reference to a backing store plus the offset the mapping starts at.
#[derive(Clone)]
pub(crate) struct Backing {
    pub(crate) store: Arc<dyn BackingStore>,
    pub(crate) offset: usize,
}

/// One contiguous virtual range of an address space.
///
/// Cloning a mapping takes another reference to its backing store.
#[derive(Clone)]
pub(crate) struct Mapping {
    pub(crate) virt: VirtualAddress,
    /// Length in bytes; only the final page may be partial.
    pub(crate) length: usize,
    pub(crate) protection: Protection,
    pub(crate) sharing: Sharing,
    pub(crate) backing: Option<Backing>,
    /// The allocator node reserved for this mapping, if it lies in the mmap window.
    pub(crate) range: Option<VirtualRange>,
    /// Stamped once by [`MappingTable::stamp`] and kept through trims and splits.
    pub(crate) generation: u64,
}

impl Mapping {
    /// Length rounded up to whole pages.
    pub(crate) fn span(&self) -> usize {
        self.length.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    pub(crate) fn end(&self) -> VirtualAddress {
        self.virt + self.span()
    }

    /// A partial final page is covered in full; its tail reads as zero.
    pub(crate) fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.virt && address < self.end()
    }

    pub(crate) fn pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let start = self.virt;
        (0..self.span() / PAGE_SIZE).map(move |page| start + page * PAGE_SIZE)
    }

    /// Number of mapped bytes in the page at `page`: a full page except at the end.
    pub(crate) fn page_length(&self, page: VirtualAddress) -> usize {
        (self.length - (page - self.virt)).min(PAGE_SIZE)
    }

    /// Backing-store offset of the page at `page`.
    pub(crate) fn offset_of(&self, page: VirtualAddress) -> usize {
        self.backing
            .as_ref()
            .map_or(0, |backing| backing.offset + (page - self.virt))
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.sharing == Sharing::Shared
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.protection.contains(Protection::WRITE)
    }

    /// Leaf attributes for pages of this mapping.
    pub(crate) fn leaf_flags(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_user(true);
        flags.set_writable(self.is_writable());
        flags.set_no_execute(!self.protection.contains(Protection::EXEC));
        flags
    }

    pub(crate) fn info(&self) -> MappingInfo {
        MappingInfo {
            start: self.virt,
            length: self.length,
            protection: self.protection,
            sharing: self.sharing,
            offset: self.backing.as_ref().map(|b| b.offset),
            range: self.range,
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("virt", &self.virt)
            .field("length", &self.length)
            .field("protection", &self.protection)
            .field("sharing", &self.sharing)
            .field("offset", &self.backing.as_ref().map(|b| b.offset))
            .field("range", &self.range)
            .field("generation", &self.generation)
            .finish()
    }
}

/// A snapshot of one mapping, detached from its backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    pub start: VirtualAddress,
    pub length: usize,
    pub protection: Protection,
    pub sharing: Sharing,
    /// Backing-store offset, or None for anonymous mappings.
    pub offset: Option<usize>,
    pub range: Option<VirtualRange>,
}

/// The ordered set of mappings of one address space, plus its range allocator.
///
/// Mappings never overlap, so the mapping covering an address is the one with the greatest
/// base not above it, if that one reaches far enough.
#[derive(Clone, Debug)]
pub(crate) struct MappingTable {
    mappings: BTreeMap<VirtualAddress, Mapping>,
    pub(crate) ranges: VirtualRangeAllocator,
    generations: u64,
}

impl MappingTable {
    pub(crate) fn new(layout: &UserLayout) -> Self {
        Self {
            mappings: BTreeMap::new(),
            ranges: VirtualRangeAllocator::new(layout.mmap_start, layout.mmap_end),
            generations: 0,
        }
    }

    /// Returns a generation no earlier mapping of this table carries.
    pub(crate) fn stamp(&mut self) -> u64 {
        self.generations += 1;
        self.generations
    }

    pub(crate) fn find(&self, address: VirtualAddress) -> Option<&Mapping> {
        self.mappings
            .range(..=address)
            .next_back()
            .map(|(_, mapping)| mapping)
            .filter(|mapping| mapping.contains(address))
    }

    /// Returns true if any mapping intersects `[start, end)`.
    pub(crate) fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.mappings
            .range(..end)
            .next_back()
            .is_some_and(|(_, mapping)| mapping.end() > start)
    }

    pub(crate) fn insert(&mut self, mapping: Mapping) {
        debug_assert!(
            !self.overlaps(mapping.virt, mapping.end()),
            "mapping {:?} overlaps an existing mapping",
            mapping
        );
        self.mappings.insert(mapping.virt, mapping);
    }

    pub(crate) fn remove(&mut self, base: VirtualAddress) -> Option<Mapping> {
        self.mappings.remove(&base)
    }

    /// Removes every mapping, in address order.
    pub(crate) fn take_all(&mut self) -> BTreeMap<VirtualAddress, Mapping> {
        core::mem::take(&mut self.mappings)
    }

    pub(crate) fn len(&self) -> usize {
        self.mappings.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }
}
