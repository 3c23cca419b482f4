//! Raw `mmap`, `munmap` and `msync` entry points.
//!
//! These take the untyped register values of a system call, validate them, and return either
//! a non-negative result or a negative errno.

use alloc::sync::Arc;

use crate::{
    AddressSpace, BackingStore, MapFlags, MapRequest, Protection, SyncFlags, VirtualAddress,
    VmError,
};

fn to_errno(result: Result<usize, VmError>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(error) => {
            log::debug!("memory syscall failed: {}", error);
            error.errno()
        }
    }
}

/// Maps `length` bytes and returns the start address.
///
/// An `addr` of zero means no preference. Unknown protection or flag bits are rejected.
pub fn mmap(
    space: &AddressSpace,
    addr: usize,
    length: usize,
    prot: u32,
    flags: u32,
    backing: Option<Arc<dyn BackingStore>>,
    offset: usize,
) -> isize {
    to_errno(map_request(addr, length, prot, flags, backing, offset).and_then(|request| {
        space.establish(request).map(VirtualAddress::as_usize)
    }))
}

fn map_request(
    addr: usize,
    length: usize,
    prot: u32,
    flags: u32,
    backing: Option<Arc<dyn BackingStore>>,
    offset: usize,
) -> Result<MapRequest, VmError> {
    let protection = Protection::from_bits(prot).ok_or(VmError::InvalidArgument)?;
    let flags = MapFlags::from_bits(flags).ok_or(VmError::InvalidArgument)?;
    let hint = match VirtualAddress::try_new(addr) {
        Some(hint) if addr != 0 => Some(hint),
        _ if flags.contains(MapFlags::FIXED) => return Err(VmError::OutOfMemory),
        _ => None,
    };

    Ok(MapRequest {
        backing,
        hint,
        protection,
        flags,
        offset,
        length,
    })
}

/// Unmaps every page in `[addr, addr + length)`.
pub fn munmap(space: &AddressSpace, addr: usize, length: usize) -> isize {
    let result = VirtualAddress::try_new(addr)
        .ok_or(VmError::InvalidArgument)
        .and_then(|start| space.unmap_range(start, length));
    to_errno(result.map(|()| 0))
}

/// Writes back the shared pages in `[addr, addr + length)`.
pub fn msync(space: &AddressSpace, addr: usize, length: usize, flags: u32) -> isize {
    let result = SyncFlags::from_bits(flags)
        .zip(VirtualAddress::try_new(addr))
        .ok_or(VmError::InvalidArgument)
        .and_then(|(flags, start)| space.sync(start, length, flags));
    to_errno(result.map(|()| 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PAGE_SIZE, Sharing, testing, testing::MockStore};

    const PROT_RW: u32 = 0x3;
    const MAP_PRIVATE_ANONYMOUS: u32 = 0x22;

    fn setup() -> AddressSpace {
        testing::setup(256);
        AddressSpace::new().unwrap()
    }

    #[test]
    fn mmap_returns_the_mapping_address() {
        let space = setup();
        let addr = mmap(&space, 0, 2 * PAGE_SIZE, PROT_RW, MAP_PRIVATE_ANONYMOUS, None, 0);

        assert!(addr > 0);
        let info = space.mapping_at(VirtualAddress::new(addr as usize)).unwrap();
        assert_eq!(info.length, 2 * PAGE_SIZE);
        assert_eq!(info.sharing, Sharing::Private);
        assert_eq!(info.offset, None);
    }

    #[test]
    fn unknown_bits_are_rejected() {
        let space = setup();
        let einval = VmError::InvalidArgument.errno();

        assert_eq!(mmap(&space, 0, PAGE_SIZE, 0x8, MAP_PRIVATE_ANONYMOUS, None, 0), einval);
        assert_eq!(mmap(&space, 0, PAGE_SIZE, PROT_RW, 0x100 | MAP_PRIVATE_ANONYMOUS, None, 0), einval);
        assert_eq!(msync(&space, 0x20_0000, PAGE_SIZE, 0x8), einval);
        assert_eq!(space.mapping_count(), 0);
    }

    #[test]
    fn errors_map_to_errno() {
        let space = setup();
        let store = MockStore::new(PAGE_SIZE);

        assert_eq!(mmap(&space, 0, 0, PROT_RW, MAP_PRIVATE_ANONYMOUS, None, 0), -22);
        assert_eq!(
            mmap(&space, 0x1234, PAGE_SIZE, PROT_RW, MAP_PRIVATE_ANONYMOUS | 0x10, None, 0),
            -12
        );
        assert_eq!(mmap(&space, 0, PAGE_SIZE, PROT_RW, 0x01, Some(store as Arc<dyn BackingStore>), PAGE_SIZE), -22);
        assert_eq!(msync(&space, 0x20_0000, PAGE_SIZE, 0x4), -14);
        assert_eq!(munmap(&space, 0x20_0001, PAGE_SIZE), -22);
    }

    #[test]
    fn munmap_and_msync_succeed_on_mapped_ranges() {
        let space = setup();
        let store = MockStore::new(2 * PAGE_SIZE);
        let addr = mmap(&space, 0, 2 * PAGE_SIZE, PROT_RW, 0x01, Some(store.clone() as Arc<dyn BackingStore>), 0);
        assert!(addr > 0);

        assert_eq!(msync(&space, addr as usize, 2 * PAGE_SIZE, 0x4), 0);
        assert_eq!(munmap(&space, addr as usize, PAGE_SIZE), 0);
        assert_eq!(munmap(&space, addr as usize, PAGE_SIZE), 0);
        assert_eq!(space.mapping_count(), 1);
        assert_eq!(munmap(&space, addr as usize + PAGE_SIZE, PAGE_SIZE), 0);
        assert_eq!(Arc::strong_count(&store), 1);
    }
}
