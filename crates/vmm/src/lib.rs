#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager (VMM) owns everything between a process and its page
//! tables. It provides:
//!
//! - A multi-level page-table walker over a direct-mapped physical window.
//! - Per-address-space virtual range allocation for `mmap`-style requests.
//! - The mapping table: establishing, trimming, splitting, syncing and tearing down mappings
//!   that are either anonymous or backed by a [`BackingStore`].
//! - Demand paging through the page-fault resolver.
//! - Address-space cloning for fork, and teardown for exit/exec.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod backing;
mod context;
mod error;
mod fault;
mod frame;
mod mapping;
mod page_directory;
mod syscall;
mod valloc;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use backing::BackingStore;
pub use context::{KernelContext, UserLayout};
pub use error::VmError;
pub use fault::{
    FaultCause, FaultContext, FaultResolution, PageFault, Signal, TaskDiagnostics,
    handle_page_fault,
};
pub use frame::{Frame, FrameAllocator};
pub use mapping::{MapFlags, MapRequest, MappingInfo, Protection, Sharing, SyncFlags};
pub use page_directory::{PageDirectory, Translation};
pub use syscall::{mmap, msync, munmap};
pub use valloc::{VirtualRange, VirtualRangeAllocator};

pub use arch::{PAGE_SIZE, PageFlags};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::EmulatedMemory;

#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use arch::read_page_fault;
