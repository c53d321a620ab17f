//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame; a set bit means allocated. First-fit scan for
//! contiguous runs. The allocator knows nothing about what the frames are
//! used for - page-map nodes, demand-paged memory and the kernel heap all
//! draw from the same pool.

use super::MemoryError;

/// Bytes per physical frame
pub const BYTES_PER_FRAME: usize = 4096;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Identifier of one physical 4 KiB frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(pub usize);

impl FrameId {
    /// Physical byte address of the frame's first byte
    pub const fn address(self) -> u64 {
        (self.0 * BYTES_PER_FRAME) as u64
    }

    /// The frame containing a physical byte address
    pub const fn containing(addr: u64) -> Self {
        Self(addr as usize / BYTES_PER_FRAME)
    }

    pub const fn offset(self, frames: usize) -> Self {
        Self(self.0 + frames)
    }
}

/// Bitmap allocator over `WORDS * 64` frames.
///
/// The word count is a const parameter so the kernel can dedicate a large
/// static bitmap while tests work with a small one on the stack.
pub struct BitmapFrameAllocator<const WORDS: usize> {
    alloc_map: [u64; WORDS],
    range_begin: FrameId,
    range_end: FrameId,
}

impl<const WORDS: usize> BitmapFrameAllocator<WORDS> {
    pub const fn new() -> Self {
        Self {
            alloc_map: [0; WORDS],
            range_begin: FrameId(0),
            range_end: FrameId(0),
        }
    }

    /// Total number of frames this bitmap can describe
    pub const fn capacity() -> usize {
        WORDS * BITS_PER_WORD
    }

    /// Restrict allocation to `[begin, end)`, typically derived from the
    /// boot memory map. `end` is clamped to the bitmap capacity.
    pub fn set_memory_range(&mut self, begin: FrameId, end: FrameId) {
        self.range_begin = begin;
        self.range_end = FrameId(end.0.min(Self::capacity()));
    }

    /// Mark `[start, start + num_frames)` as in use without going through
    /// allocation, for regions the memory map reports as reserved.
    /// Frames beyond the bitmap's capacity are ignored; nothing past it is
    /// ever handed out anyway.
    pub fn mark_allocated(&mut self, start: FrameId, num_frames: usize) {
        for i in 0..num_frames {
            let frame = FrameId(start.0 + i);
            if frame.0 >= Self::capacity() {
                break;
            }
            self.set_bit(frame, true);
        }
    }

    /// Allocate `num_frames` contiguous frames, first fit.
    pub fn allocate(&mut self, num_frames: usize) -> Result<FrameId, MemoryError> {
        if num_frames == 0 {
            return Err(MemoryError::InvalidArgument);
        }

        let mut start = self.range_begin.0;
        loop {
            let mut i = 0;
            while i < num_frames {
                if start + i >= self.range_end.0 {
                    return Err(MemoryError::NoEnoughMemory);
                }
                if self.get_bit(FrameId(start + i)) {
                    break;
                }
                i += 1;
            }

            if i == num_frames {
                self.mark_allocated(FrameId(start), num_frames);
                return Ok(FrameId(start));
            }

            // Skip past the allocated frame that stopped the run
            start += i + 1;
        }
    }

    /// Return `num_frames` starting at `start` to the pool.
    pub fn free(&mut self, start: FrameId, num_frames: usize) -> Result<(), MemoryError> {
        if start.0 + num_frames > Self::capacity() {
            return Err(MemoryError::InvalidFrame);
        }
        for i in 0..num_frames {
            self.set_bit(FrameId(start.0 + i), false);
        }
        Ok(())
    }

    /// Number of currently free frames inside the configured range
    pub fn available_frames(&self) -> usize {
        (self.range_begin.0..self.range_end.0)
            .filter(|&f| !self.get_bit(FrameId(f)))
            .count()
    }

    fn get_bit(&self, frame: FrameId) -> bool {
        let word = frame.0 / BITS_PER_WORD;
        let bit = frame.0 % BITS_PER_WORD;
        (self.alloc_map[word] >> bit) & 1 == 1
    }

    fn set_bit(&mut self, frame: FrameId, allocated: bool) {
        let word = frame.0 / BITS_PER_WORD;
        let bit = frame.0 % BITS_PER_WORD;
        if allocated {
            self.alloc_map[word] |= 1 << bit;
        } else {
            self.alloc_map[word] &= !(1 << bit);
        }
    }
}

/// Run `f` over the bytes of a frame.
///
/// In the kernel the frame is reached through the identity mapping. Host
/// tests get a scratch page instead, since there is no physical memory to
/// reach; callers treat the contents as opaque either way.
pub fn with_frame_bytes<R>(frame: FrameId, f: impl FnOnce(&mut [u8; BYTES_PER_FRAME]) -> R) -> R {
    #[cfg(not(test))]
    {
        let bytes = unsafe { &mut *(frame.address() as *mut [u8; BYTES_PER_FRAME]) };
        f(bytes)
    }
    #[cfg(test)]
    {
        let _ = frame;
        let mut scratch = alloc::boxed::Box::new([0u8; BYTES_PER_FRAME]);
        f(&mut scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type SmallAllocator = BitmapFrameAllocator<16>; // 1024 frames

    fn fresh() -> SmallAllocator {
        let mut a = SmallAllocator::new();
        a.set_memory_range(FrameId(0), FrameId(1024));
        a
    }

    #[test]
    fn test_allocate_and_free() {
        let mut a = fresh();
        let f1 = a.allocate(1).unwrap();
        let f2 = a.allocate(1).unwrap();
        assert_ne!(f1, f2);
        a.free(f1, 1).unwrap();
        // Freed frame is reused (first fit)
        let f3 = a.allocate(1).unwrap();
        assert_eq!(f1, f3);
    }

    #[test]
    fn test_contiguous_runs() {
        let mut a = fresh();
        let run = a.allocate(8).unwrap();
        let single = a.allocate(1).unwrap();
        assert_eq!(single.0, run.0 + 8);

        // Free the run; the next 8-frame request fits in the hole again
        a.free(run, 8).unwrap();
        assert_eq!(a.allocate(8).unwrap(), run);
    }

    #[test]
    fn test_exhaustion() {
        let mut a = SmallAllocator::new();
        a.set_memory_range(FrameId(0), FrameId(4));
        a.allocate(4).unwrap();
        assert_eq!(a.allocate(1), Err(MemoryError::NoEnoughMemory));
    }

    #[test]
    fn test_mark_allocated_excludes_reserved() {
        let mut a = fresh();
        a.mark_allocated(FrameId(0), 4);
        let f = a.allocate(1).unwrap();
        assert_eq!(f, FrameId(4));
    }

    #[test]
    fn test_frame_addressing() {
        assert_eq!(FrameId(1).address(), 4096);
        assert_eq!(FrameId::containing(8192 + 12), FrameId(2));
    }

    #[test]
    fn test_zero_frames_rejected() {
        let mut a = fresh();
        assert_eq!(a.allocate(0), Err(MemoryError::InvalidArgument));
    }
}
