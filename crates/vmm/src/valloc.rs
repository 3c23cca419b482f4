//! Virtual range allocation for user mappings.
//!
//! Each address space owns one [`VirtualRangeAllocator`] covering its mmap window. It hands
//! out page-granular ranges first-fit from a sorted free list and coalesces ranges as they
//! are returned. Allocated ranges are tracked as nodes so that a node can later be split when
//! a mapping is cut in two.

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{VirtualAddress, arch::PAGE_SIZE};

/// A page-granular span of virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    start: VirtualAddress,
    pages: usize,
}

impl VirtualRange {
    /// Creates a range of `pages` pages starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not page-aligned.
    pub const fn new(start: VirtualAddress, pages: usize) -> Self {
        assert!(start.is_aligned(PAGE_SIZE), "range start must be page-aligned");
        Self { start, pages }
    }

    /// Returns the first address of the range.
    pub const fn start(self) -> VirtualAddress {
        self.start
    }

    /// Returns the number of pages in the range.
    pub const fn pages(self) -> usize {
        self.pages
    }

    /// Returns the length of the range in bytes.
    pub const fn length(self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// Returns the first address past the range.
    pub fn end(self) -> VirtualAddress {
        self.start + self.length()
    }

    /// Returns true if `virt` lies within the range.
    pub fn contains(self, virt: VirtualAddress) -> bool {
        virt >= self.start && virt < self.end()
    }

    fn contains_range(self, other: VirtualRange) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }
}

/// First-fit allocator over a fixed window of virtual address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualRangeAllocator {
    window: VirtualRange,
    /// Free ranges, sorted by start address. Adjacent ranges are always coalesced.
    free: Vec<VirtualRange>,
    /// Allocated nodes, keyed by start address, valued in pages.
    used: BTreeMap<VirtualAddress, usize>,
}

impl VirtualRangeAllocator {
    /// Creates an allocator over `[start, end)` with the whole window free.
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        assert!(
            start.is_aligned(PAGE_SIZE) && end.is_aligned(PAGE_SIZE) && start < end,
            "allocator window must be a non-empty page-aligned range"
        );
        let window = VirtualRange::new(start, (end - start) / PAGE_SIZE);
        Self {
            window,
            free: alloc::vec![window],
            used: BTreeMap::new(),
        }
    }

    /// Returns the window this allocator manages.
    pub fn window(&self) -> VirtualRange {
        self.window
    }

    /// Returns the number of pages currently allocated.
    pub fn used_pages(&self) -> usize {
        self.used.values().sum()
    }

    /// Returns the number of pages currently free.
    pub fn free_pages(&self) -> usize {
        self.free.iter().map(|r| r.pages).sum()
    }

    /// Returns the allocated nodes in address order.
    pub fn allocated(&self) -> impl Iterator<Item = VirtualRange> + '_ {
        self.used
            .iter()
            .map(|(&start, &pages)| VirtualRange::new(start, pages))
    }

    /// Allocates `pages` contiguous pages, first-fit.
    pub fn allocate(&mut self, pages: usize) -> Option<VirtualRange> {
        if pages == 0 {
            return None;
        }

        let index = self.free.iter().position(|r| r.pages >= pages)?;
        let entry = self.free[index];
        let range = VirtualRange::new(entry.start, pages);
        if entry.pages == pages {
            self.free.remove(index);
        } else {
            self.free[index] = VirtualRange::new(range.end(), entry.pages - pages);
        }

        self.used.insert(range.start, range.pages);
        Some(range)
    }

    /// Claims a specific range. Returns false if any page of it is not free.
    pub fn reserve(&mut self, range: VirtualRange) -> bool {
        if range.pages == 0 {
            return false;
        }
        let Some(index) = self.free.iter().position(|r| r.contains_range(range)) else {
            return false;
        };

        let entry = self.free.remove(index);
        let before = (range.start - entry.start) / PAGE_SIZE;
        let after = (entry.end() - range.end()) / PAGE_SIZE;
        if after > 0 {
            self.free.insert(index, VirtualRange::new(range.end(), after));
        }
        if before > 0 {
            self.free.insert(index, VirtualRange::new(entry.start, before));
        }

        self.used.insert(range.start, range.pages);
        true
    }

    /// Returns an allocated node to the free pool.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not exactly an allocated node.
    pub fn deallocate(&mut self, range: VirtualRange) {
        match self.used.get(&range.start) {
            Some(&pages) if pages == range.pages => {
                self.used.remove(&range.start);
            }
            _ => panic!("deallocating {:?}, which is not an allocated range", range),
        }

        let index = self.free.partition_point(|r| r.start < range.start);
        let merge_prev = index > 0 && self.free[index - 1].end() == range.start;
        let merge_next = index < self.free.len() && self.free[index].start == range.end();

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.free.remove(index);
                self.free[index - 1].pages += range.pages + next.pages;
            }
            (true, false) => self.free[index - 1].pages += range.pages,
            (false, true) => {
                let next = self.free[index];
                self.free[index] = VirtualRange::new(range.start, range.pages + next.pages);
            }
            (false, false) => self.free.insert(index, range),
        }
    }

    /// Splits an allocated node into two nodes, the first `page_offset` pages long.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not exactly an allocated node, or if either half would be empty.
    pub fn split(&mut self, range: VirtualRange, page_offset: usize) -> (VirtualRange, VirtualRange) {
        assert!(
            self.used.get(&range.start) == Some(&range.pages),
            "splitting {:?}, which is not an allocated range",
            range
        );
        assert!(
            page_offset > 0 && page_offset < range.pages,
            "split offset must leave both halves non-empty"
        );

        let head = VirtualRange::new(range.start, page_offset);
        let tail = VirtualRange::new(head.end(), range.pages - page_offset);
        self.used.insert(head.start, head.pages);
        self.used.insert(tail.start, tail.pages);
        (head, tail)
    }

    /// Frees the single page `page` out of the allocated node `range`.
    ///
    /// Returns the allocated nodes left before and after the page, if any.
    pub fn release_page(
        &mut self,
        range: VirtualRange,
        page: VirtualAddress,
    ) -> (Option<VirtualRange>, Option<VirtualRange>) {
        assert!(range.contains(page), "page {} is outside {:?}", page, range);

        let offset = (page - range.start) / PAGE_SIZE;
        let (before, rest) = if offset > 0 {
            let (head, tail) = self.split(range, offset);
            (Some(head), tail)
        } else {
            (None, range)
        };
        let (single, after) = if rest.pages > 1 {
            let (head, tail) = self.split(rest, 1);
            (head, Some(tail))
        } else {
            (rest, None)
        };

        self.deallocate(single);
        (before, after)
    }
}
