//! The backing-store contract.
//!
//! A backing store is the file or inode a mapping draws its content from. Its implementation
//! lives in the filesystem layer; the virtual memory manager only calls through this trait.
//! References are counted by `Arc`: each mapping holds one, and a store is destroyed when the
//! last mapping in any address space lets go of it.

use crate::{Frame, PageFlags, VirtualAddress, VmError};

/// Page content provider for file-backed mappings.
///
/// Calls may block on I/O. The virtual memory manager never makes them while holding a
/// mapping lock or a page-table lock.
pub trait BackingStore: Send + Sync {
    /// Returns the current length of the store in bytes.
    fn length(&self) -> usize;

    /// Returns the frame holding the page at `offset`, shared by every mapper of that page.
    ///
    /// If `populate` is set the page is read in when it is not resident yet. Bytes past the end
    /// of the store read as zero. The frame stays owned by the store; the caller only maps it
    /// at `virt` with `flags`.
    fn populate_shared_page(
        &self,
        virt: VirtualAddress,
        offset: usize,
        populate: bool,
        flags: PageFlags,
    ) -> Result<Frame, VmError>;

    /// Copies the content at `offset` into `page`, a private frame about to be mapped at
    /// `virt` with `flags`.
    ///
    /// `page` is already zeroed and its length is the number of bytes to transfer, which is
    /// less than a page for the final partial page of a mapping.
    fn populate_private_page(
        &self,
        virt: VirtualAddress,
        offset: usize,
        flags: PageFlags,
        page: &mut [u8],
    ) -> Result<(), VmError>;

    /// Writes back every resident shared page in `[offset, offset + length)`.
    fn sync_region(&self, virt: VirtualAddress, offset: usize, length: usize) -> Result<(), VmError>;

    /// Writes back the first `length` bytes of the shared page at `offset`.
    fn sync_page(&self, virt: VirtualAddress, offset: usize, length: usize) -> Result<(), VmError>;

    /// Records that `[offset, offset + length)` is now mapped shared by one more mapper.
    fn register_mapped_region(&self, offset: usize, length: usize);

    /// Records that the mapper at `virt` no longer maps `[offset, offset + length)`.
    fn unmap_region(&self, virt: VirtualAddress, offset: usize, length: usize);
}
