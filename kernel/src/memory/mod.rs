//! Memory management: physical frames, page maps, demand paging.
//!
//! All mutable state lives in one [`MemoryManager`] behind an
//! interrupt-safe lock: the frame bitmap, the page-map arena and the
//! kernel's own address-space root. Tasks hold root handles; every
//! structural operation goes through this module.

pub mod fault;
pub mod frame;
pub mod paging;

use frame::{BitmapFrameAllocator, FrameId, BYTES_PER_FRAME};
use paging::{NodeHandle, PageMapArena, Translation, VirtualAddress};

use crate::boot::{MemoryRegion, MemoryRegionKind};
use crate::sync::InterruptSafeLock;

/// Errors of the memory subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The frame allocator has no run of frames left to satisfy a request
    NoEnoughMemory,
    /// A zero-sized or otherwise nonsensical request
    InvalidArgument,
    /// A frame outside the allocator's range
    InvalidFrame,
    /// A node handle that is not (or no longer) owned by the arena
    NoSuchNode,
    /// The requested virtual page already has a mapping
    AlreadyMapped,
}

/// Maximum physical memory the frame bitmap can describe: 128 GiB
const MAX_PHYSICAL_FRAMES: usize = (128 * 1024 * 1024 * 1024) / BYTES_PER_FRAME;
const FRAME_BITMAP_WORDS: usize = MAX_PHYSICAL_FRAMES / 64;

/// Frames handed to the kernel heap at boot (128 MiB)
const KERNEL_HEAP_FRAMES: usize = 64 * 512;

pub type PhysFrameAllocator = BitmapFrameAllocator<FRAME_BITMAP_WORDS>;

pub struct MemoryManager {
    frames: PhysFrameAllocator,
    arena: PageMapArena,
    kernel_root: Option<NodeHandle>,
}

impl MemoryManager {
    pub const fn new() -> Self {
        Self {
            frames: PhysFrameAllocator::new(),
            arena: PageMapArena::new(),
            kernel_root: None,
        }
    }
}

// The frame bitmap is several MiB; a plain const-initialized static keeps
// it in .bss instead of ever existing on a kernel stack.
static MEMORY: InterruptSafeLock<MemoryManager> = InterruptSafeLock::new(MemoryManager::new());

/// Bring up the memory subsystem from the boot memory map: frame bitmap,
/// kernel heap, then the kernel's identity-mapped address space.
pub fn init(memory_map: &[MemoryRegion]) -> Result<(), MemoryError> {
    {
        let mut m = MEMORY.lock();

        let mut max_frame = FrameId(0);
        for region in memory_map {
            let end = FrameId::containing(region.end);
            if end > max_frame {
                max_frame = end;
            }
        }
        m.frames.set_memory_range(FrameId(1), max_frame);

        // Everything the map does not call usable stays allocated forever.
        for region in memory_map {
            if region.kind != MemoryRegionKind::Usable {
                let start = FrameId::containing(region.start);
                let count = (region.end - region.start) as usize / BYTES_PER_FRAME;
                m.frames.mark_allocated(start, count);
            }
        }

        let heap_start = m.frames.allocate(KERNEL_HEAP_FRAMES)?;
        init_heap(heap_start, KERNEL_HEAP_FRAMES);
    }

    // The arena needs the heap, so the identity map is built second.
    let root = {
        let mut m = MEMORY.lock();
        let MemoryManager { frames, arena, kernel_root } = &mut *m;
        let root = arena.new_page_map(frames)?;
        arena.setup_identity_map(root, frames)?;
        *kernel_root = Some(root);
        root
    };

    activate_address_space(root);
    Ok(())
}

#[cfg(not(test))]
fn init_heap(start: FrameId, num_frames: usize) {
    unsafe {
        crate::ALLOCATOR
            .lock()
            .init(start.address() as *mut u8, num_frames * BYTES_PER_FRAME);
    }
}

#[cfg(test)]
fn init_heap(_start: FrameId, _num_frames: usize) {}

/// Point the CPU at an address-space root.
#[cfg(not(test))]
fn activate_address_space(root: NodeHandle) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(root.address())),
            Cr3Flags::empty(),
        );
    }
}

#[cfg(test)]
fn activate_address_space(_root: NodeHandle) {}

/// Allocate a fresh address space sharing the kernel's identity half.
pub fn new_address_space() -> Result<NodeHandle, MemoryError> {
    let mut m = MEMORY.lock();
    let MemoryManager { frames, arena, kernel_root } = &mut *m;
    let kernel_root = kernel_root.ok_or(MemoryError::NoSuchNode)?;
    arena.new_address_space(kernel_root, frames)
}

/// Duplicate an address space: fresh root sharing the kernel half, task
/// half deep-copied (nodes and leaf frame contents both).
pub fn clone_address_space(src: NodeHandle) -> Result<NodeHandle, MemoryError> {
    let dest = new_address_space()?;
    let mut m = MEMORY.lock();
    let MemoryManager { frames, arena, .. } = &mut *m;
    arena.copy_page_maps(dest, src, 4, paging::USER_PML4_START, frames)?;
    Ok(dest)
}

/// Release an address space and everything it exclusively owns.
pub fn free_address_space(root: NodeHandle) -> Result<(), MemoryError> {
    let mut m = MEMORY.lock();
    let MemoryManager { frames, arena, .. } = &mut *m;
    arena.free_page_map(root, frames)
}

/// Commit exactly one writable page at `page` (demand-paging resolution).
pub fn map_demand_page(root: NodeHandle, page: VirtualAddress) -> Result<(), MemoryError> {
    let mut m = MEMORY.lock();
    let MemoryManager { frames, arena, .. } = &mut *m;
    arena.setup_page_maps(root, page, 1, true, frames)
}

/// Translate through an address-space root.
pub fn translate(root: NodeHandle, addr: VirtualAddress) -> Option<Translation> {
    MEMORY.lock().arena.translate(root, addr)
}

/// Copy the bytes of one frame into another through the identity mapping.
pub(crate) fn copy_frame_contents(src: FrameId, dest: FrameId) {
    #[cfg(not(test))]
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.address() as *const u8,
            dest.address() as *mut u8,
            BYTES_PER_FRAME,
        );
    }
    #[cfg(test)]
    {
        let _ = (src, dest);
    }
}

#[cfg(test)]
mod tests {
    use super::paging::VirtualAddress;
    use super::*;

    // Exercises the demand-paging resolution path against the real global
    // manager; no other test touches it.
    #[test]
    fn test_demand_fault_commits_exactly_one_page() {
        {
            let mut m = MEMORY.lock();
            m.frames.set_memory_range(FrameId(0), FrameId(512));
        }
        let root = {
            let mut m = MEMORY.lock();
            let MemoryManager { frames, arena, .. } = &mut *m;
            arena.new_page_map(frames).unwrap()
        };

        let addr = VirtualAddress(0xFFFF_8000_0000_0000);
        let before = MEMORY.lock().frames.available_frames();
        map_demand_page(root, addr).unwrap();
        let after = MEMORY.lock().frames.available_frames();

        // First touch: three intermediate nodes plus exactly one leaf frame
        assert_eq!(before - after, 4);
        assert!(translate(root, addr).is_some());

        // The page is mapped now, so the same address cannot fault into a
        // second frame - no repeated fault storms for one untouched page.
        assert_eq!(map_demand_page(root, addr), Err(MemoryError::AlreadyMapped));

        // A neighboring page costs only its leaf frame
        let before = MEMORY.lock().frames.available_frames();
        map_demand_page(root, VirtualAddress(addr.0 + 4096)).unwrap();
        let after = MEMORY.lock().frames.available_frames();
        assert_eq!(before - after, 1);
    }
}
