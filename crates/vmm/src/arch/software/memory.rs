//! Emulated physical memory for software simulation.

use core::ptr::NonNull;
use std::alloc::{Layout, alloc_zeroed, dealloc};

use alloc::vec::Vec;

use crate::{Frame, FrameAllocator};

use super::{MAX_PHYSICAL_BITS, PAGE_SIZE};

/// Byte pattern written over freed frames so stale reads stand out.
const POISON: u8 = 0xCC;

struct FramePool {
    /// Next never-allocated frame number.
    next: usize,
    /// Frames returned by `free_frame`, reused LIFO.
    free: Vec<usize>,
    in_use: Vec<bool>,
    allocated: usize,
}

/// Emulated memory for software simulation.
///
/// This provides a simulated physical memory space for testing page table operations
/// without requiring actual hardware or virtual memory support from the host OS. The
/// space is carved into frames and doubles as the frame allocator, so tests can account
/// for every frame the subsystem takes and returns.
///
/// Frame 0 is never handed out, so a zero physical address always means "nothing".
pub struct EmulatedMemory {
    base: NonNull<u8>,
    frame_count: usize,
    pool: spin::Mutex<FramePool>,
}

// SAFETY: The buffer is only reached through raw pointers handed out by `translate`; the
// bookkeeping is behind a lock.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new emulated memory region holding `frame_count` frames.
    ///
    /// # Panics
    /// Panics if the region would not fit in the emulated physical address width.
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count >= 2, "emulated memory needs at least two frames");
        assert!(
            frame_count * PAGE_SIZE <= 1 << MAX_PHYSICAL_BITS,
            "emulated memory exceeds the physical address width"
        );

        let layout = Self::layout(frame_count);
        // SAFETY: The layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));

        Self {
            base,
            frame_count,
            pool: spin::Mutex::new(FramePool {
                next: 1,
                free: Vec::new(),
                in_use: alloc::vec![false; frame_count],
                allocated: 0,
            }),
        }
    }

    fn layout(frame_count: usize) -> Layout {
        Layout::from_size_align(frame_count * PAGE_SIZE, PAGE_SIZE)
            .unwrap_or_else(|_| panic!("invalid emulated memory layout"))
    }

    /// Translates a physical address to a host pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: Bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a host pointer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size(), "pointer not within emulated memory");
        offset
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.frame_count * PAGE_SIZE
    }

    /// Returns the number of frames currently handed out.
    pub fn allocated_frames(&self) -> usize {
        self.pool.lock().allocated
    }

    /// Returns true if the frame is currently handed out.
    pub fn is_allocated(&self, frame: Frame) -> bool {
        self.pool
            .lock()
            .in_use
            .get(frame.number())
            .copied()
            .unwrap_or(false)
    }
}

impl FrameAllocator for EmulatedMemory {
    fn allocate_frame(&self) -> Option<Frame> {
        let mut pool = self.pool.lock();
        let number = match pool.free.pop() {
            Some(number) => number,
            None if pool.next < self.frame_count => {
                pool.next += 1;
                pool.next - 1
            }
            None => return None,
        };
        pool.in_use[number] = true;
        pool.allocated += 1;
        Some(Frame::from_number(number))
    }

    fn free_frame(&self, frame: Frame) {
        let number = frame.number();
        {
            let mut pool = self.pool.lock();
            assert!(
                pool.in_use.get(number).copied().unwrap_or(false),
                "double free of emulated frame {:#x}",
                frame.start_address().as_usize()
            );
            pool.in_use[number] = false;
            pool.allocated -= 1;
            pool.free.push(number);
        }

        // SAFETY: The frame lies inside the buffer and is no longer owned by anyone.
        unsafe {
            core::ptr::write_bytes(
                self.translate(frame.start_address().as_usize()),
                POISON,
                PAGE_SIZE,
            );
        }
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: Allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.frame_count)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_hands_out_frame_zero() {
        let memory = EmulatedMemory::new(4);
        let frames: Vec<Frame> = core::iter::from_fn(|| memory.allocate_frame()).collect();

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.number() != 0));
        assert_eq!(memory.allocated_frames(), 3);
    }

    #[test]
    fn freed_frames_are_reused() {
        let memory = EmulatedMemory::new(4);
        let frame = memory.allocate_frame().unwrap();
        memory.free_frame(frame);

        assert_eq!(memory.allocated_frames(), 0);
        assert_eq!(memory.allocate_frame(), Some(frame));
    }

    #[test]
    fn buffer_is_page_aligned() {
        let memory = EmulatedMemory::new(4);
        assert_eq!(memory.translate(0) as usize % PAGE_SIZE, 0);
        assert_eq!(memory.ptr_to_phys(memory.translate(PAGE_SIZE)), PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "double free of emulated frame")]
    fn double_free_panics() {
        let memory = EmulatedMemory::new(4);
        let frame = memory.allocate_frame().unwrap();
        memory.free_frame(frame);
        memory.free_frame(frame);
    }
}
