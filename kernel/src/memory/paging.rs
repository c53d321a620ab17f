//! 4-level hierarchical page maps.
//!
//! ```text
//! Virtual Address (48-bit):
//! ┌─────┬─────┬─────┬─────┬──────────┐
//! │ PML4│ PDP │ PD  │ PT  │  Offset  │
//! │ 9bit│ 9bit│ 9bit│ 9bit│  12bit   │
//! │47-39│38-30│29-21│20-12│   11-0   │
//! └─────┴─────┴─────┴─────┴──────────┘
//! ```
//!
//! Nodes live in an arena keyed by opaque [`NodeHandle`]s rather than being
//! reached through raw address casts: a node is owned by exactly one parent
//! entry, the arena map makes creation and release explicit, and every node
//! is charged against the frame allocator so exhaustion surfaces as
//! [`MemoryError::NoEnoughMemory`].
//!
//! The address space is split in half. The low half is the kernel's
//! identity mapping (2 MiB pages, shared into every address space at the
//! root and never freed by per-task cleanup). The high half - PML4 slots
//! 256..512 - belongs to tasks; demand-paged regions and file mappings all
//! live there.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use bitflags::bitflags;

use super::frame::{BitmapFrameAllocator, FrameId, BYTES_PER_FRAME};
use super::MemoryError;

/// Entries per page-map node
pub const ENTRIES_PER_NODE: usize = 512;

/// First PML4 slot belonging to tasks; everything below is the kernel's
/// identity-mapped range and is never touched by per-task cleanup.
pub const USER_PML4_START: usize = 256;

/// Lowest virtual address handed out to tasks. Pointers below this value
/// are kernel memory and rejected by syscall validation.
pub const USER_ADDRESS_BASE: u64 = 0x8000_0000_0000_0000;

/// GiB covered by the kernel identity mapping
pub const IDENTITY_MAP_GIBS: usize = 64;

bitflags! {
    /// Attribute bits of a page-map entry
    pub struct PageAttr: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// 2 MiB page when set on a PD-level entry
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A virtual address with per-level index accessors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    /// Index into the node at `level` (4 = PML4 .. 1 = PT)
    pub fn part(self, level: u8) -> usize {
        debug_assert!((1..=4).contains(&level));
        ((self.0 >> (12 + 9 * (level as u64 - 1))) & 0x1FF) as usize
    }

    pub fn page_offset(self) -> u64 {
        self.0 & 0xFFF
    }

    pub fn is_user(self) -> bool {
        self.0 >= USER_ADDRESS_BASE
    }

    pub fn align_down_to_page(self) -> Self {
        Self(self.0 & !0xFFF)
    }
}

/// One 64-bit page-map entry: attribute bits plus either a child node
/// handle (levels 4..2) or a mapped frame (PT level, or PD level with HUGE)
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapEntry(u64);

impl PageMapEntry {
    pub const ABSENT: Self = Self(0);

    fn child(handle: NodeHandle, attr: PageAttr) -> Self {
        Self((handle.0 & ADDR_MASK) | attr.bits())
    }

    fn frame(frame: FrameId, attr: PageAttr) -> Self {
        Self((frame.address() & ADDR_MASK) | attr.bits())
    }

    pub fn is_present(self) -> bool {
        self.attr().contains(PageAttr::PRESENT)
    }

    pub fn is_huge(self) -> bool {
        self.attr().contains(PageAttr::HUGE)
    }

    pub fn is_writable(self) -> bool {
        self.attr().contains(PageAttr::WRITABLE)
    }

    pub fn attr(self) -> PageAttr {
        PageAttr::from_bits_truncate(self.0)
    }

    fn address(self) -> u64 {
        self.0 & ADDR_MASK
    }

    fn child_handle(self) -> NodeHandle {
        NodeHandle(self.address())
    }

    fn mapped_frame(self) -> FrameId {
        FrameId::containing(self.address())
    }
}

/// One node of the radix tree: 512 entries, exactly one 4 KiB frame
#[repr(C, align(4096))]
pub struct PageMapNode {
    entries: [PageMapEntry; ENTRIES_PER_NODE],
}

impl PageMapNode {
    fn zeroed() -> Self {
        Self {
            entries: [PageMapEntry::ABSENT; ENTRIES_PER_NODE],
        }
    }

    pub fn entry(&self, index: usize) -> PageMapEntry {
        self.entries[index]
    }

    fn set_entry(&mut self, index: usize, entry: PageMapEntry) {
        self.entries[index] = entry;
    }
}

/// Opaque handle to a node owned by the arena.
///
/// The handle value is the node's (identity-mapped) address, so the root
/// handle of an address space is directly loadable as a page-map base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeHandle(u64);

impl NodeHandle {
    pub fn address(self) -> u64 {
        self.0
    }
}

struct OwnedNode {
    node: Box<PageMapNode>,
    /// Frame charged to the frame allocator for this node's storage
    charge: FrameId,
}

/// Result of a successful translation walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub phys_addr: u64,
    pub writable: bool,
}

/// Owner of every page-map node in the system.
///
/// A node is owned by exactly one parent entry; the arena map is the
/// backing store that makes that ownership auditable and release explicit.
pub struct PageMapArena {
    nodes: BTreeMap<u64, OwnedNode>,
}

impl PageMapArena {
    pub const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Allocate and zero-initialize one page-map node, charging one frame.
    pub fn new_page_map<const W: usize>(
        &mut self,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<NodeHandle, MemoryError> {
        let charge = frames.allocate(1)?;
        let node = Box::new(PageMapNode::zeroed());
        let handle = NodeHandle(&*node as *const PageMapNode as u64);
        self.nodes.insert(handle.0, OwnedNode { node, charge });
        Ok(handle)
    }

    /// Release one node and return its frame charge.
    fn free_node<const W: usize>(
        &mut self,
        handle: NodeHandle,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<(), MemoryError> {
        let owned = self.nodes.remove(&handle.0).ok_or(MemoryError::NoSuchNode)?;
        frames.free(owned.charge, 1)?;
        Ok(())
    }

    fn node(&self, handle: NodeHandle) -> Result<&PageMapNode, MemoryError> {
        self.nodes
            .get(&handle.0)
            .map(|o| &*o.node)
            .ok_or(MemoryError::NoSuchNode)
    }

    fn node_mut(&mut self, handle: NodeHandle) -> Result<&mut PageMapNode, MemoryError> {
        self.nodes
            .get_mut(&handle.0)
            .map(|o| &mut *o.node)
            .ok_or(MemoryError::NoSuchNode)
    }

    /// Number of live nodes (used by tests and diagnostics)
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Build the kernel's identity mapping under `root`: PML4 slot 0 maps
    /// the first [`IDENTITY_MAP_GIBS`] GiB with 2 MiB pages.
    pub fn setup_identity_map<const W: usize>(
        &mut self,
        root: NodeHandle,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<(), MemoryError> {
        let table_attr = PageAttr::PRESENT | PageAttr::WRITABLE;
        let page_attr = PageAttr::PRESENT | PageAttr::WRITABLE | PageAttr::HUGE;

        let pdp = self.new_page_map(frames)?;
        for gib in 0..IDENTITY_MAP_GIBS {
            let pd = self.new_page_map(frames)?;
            for i in 0..ENTRIES_PER_NODE {
                let phys = (gib as u64) * 0x4000_0000 + (i as u64) * 0x20_0000;
                self.node_mut(pd)?
                    .set_entry(i, PageMapEntry::frame(FrameId::containing(phys), page_attr));
            }
            self.node_mut(pdp)?.set_entry(gib, PageMapEntry::child(pd, table_attr));
        }
        self.node_mut(root)?.set_entry(0, PageMapEntry::child(pdp, table_attr));
        Ok(())
    }

    /// Create a fresh address-space root. The kernel's low-half entries are
    /// copied in by reference: the identity subtree is shared, not cloned.
    pub fn new_address_space<const W: usize>(
        &mut self,
        kernel_root: NodeHandle,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<NodeHandle, MemoryError> {
        let root = self.new_page_map(frames)?;
        for i in 0..USER_PML4_START {
            let entry = self.node(kernel_root)?.entry(i);
            if entry.is_present() {
                self.node_mut(root)?.set_entry(i, entry);
            }
        }
        Ok(root)
    }

    /// Walk (and create) the 4-level path for `num_pages` pages starting at
    /// `addr`, allocating intermediate nodes on demand and committing one
    /// leaf frame per page.
    ///
    /// Demand-paged regions do not call this up front - leaf commitment is
    /// deferred to the first fault, which maps exactly one page.
    pub fn setup_page_maps<const W: usize>(
        &mut self,
        root: NodeHandle,
        addr: VirtualAddress,
        num_pages: usize,
        writable: bool,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<(), MemoryError> {
        let table_attr = PageAttr::PRESENT | PageAttr::WRITABLE | PageAttr::USER;
        let mut leaf_attr = PageAttr::PRESENT | PageAttr::USER;
        if writable {
            leaf_attr |= PageAttr::WRITABLE;
        }

        let mut page = addr.align_down_to_page();
        for _ in 0..num_pages {
            let mut table = root;
            for level in (2..=4).rev() {
                let index = page.part(level);
                let entry = self.node(table)?.entry(index);
                table = if entry.is_present() {
                    if entry.is_huge() {
                        return Err(MemoryError::AlreadyMapped);
                    }
                    entry.child_handle()
                } else {
                    let child = self.new_page_map(frames)?;
                    self.node_mut(table)?
                        .set_entry(index, PageMapEntry::child(child, table_attr));
                    child
                };
            }

            let pt_index = page.part(1);
            if self.node(table)?.entry(pt_index).is_present() {
                return Err(MemoryError::AlreadyMapped);
            }
            let frame = frames.allocate(1)?;
            self.node_mut(table)?
                .set_entry(pt_index, PageMapEntry::frame(frame, leaf_attr));

            page = VirtualAddress(page.0 + BYTES_PER_FRAME as u64);
        }
        Ok(())
    }

    /// Translate a virtual address through `root`.
    ///
    /// A partial path - any absent entry on the way down - means the
    /// address is not mapped, never a partially valid translation.
    pub fn translate(&self, root: NodeHandle, addr: VirtualAddress) -> Option<Translation> {
        let mut table = root;
        for level in (2..=4).rev() {
            let entry = self.node(table).ok()?.entry(addr.part(level));
            if !entry.is_present() {
                return None;
            }
            if level == 2 && entry.is_huge() {
                let offset = addr.0 & 0x1F_FFFF;
                return Some(Translation {
                    phys_addr: entry.address() + offset,
                    writable: entry.is_writable(),
                });
            }
            table = entry.child_handle();
        }

        let entry = self.node(table).ok()?.entry(addr.part(1));
        if !entry.is_present() {
            return None;
        }
        Some(Translation {
            phys_addr: entry.address() + addr.page_offset(),
            writable: entry.is_writable(),
        })
    }

    /// Release every mapping at or above `from`, strictly staying out of
    /// the kernel's identity-mapped slots. Leaf frames and intermediate
    /// nodes below the cut are returned to the frame allocator.
    pub fn clean_page_maps<const W: usize>(
        &mut self,
        root: NodeHandle,
        from: VirtualAddress,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<(), MemoryError> {
        let start = from.part(4).max(USER_PML4_START);
        for index in start..ENTRIES_PER_NODE {
            let entry = self.node(root)?.entry(index);
            if entry.is_present() {
                self.clean_subtree(entry.child_handle(), 3, frames)?;
                self.free_node(entry.child_handle(), frames)?;
                self.node_mut(root)?.set_entry(index, PageMapEntry::ABSENT);
            }
        }
        Ok(())
    }

    fn clean_subtree<const W: usize>(
        &mut self,
        handle: NodeHandle,
        level: u8,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<(), MemoryError> {
        for index in 0..ENTRIES_PER_NODE {
            let entry = self.node(handle)?.entry(index);
            if !entry.is_present() {
                continue;
            }
            if level == 1 || entry.is_huge() {
                frames.free(entry.mapped_frame(), 1)?;
            } else {
                self.clean_subtree(entry.child_handle(), level - 1, frames)?;
                self.free_node(entry.child_handle(), frames)?;
            }
            self.node_mut(handle)?.set_entry(index, PageMapEntry::ABSENT);
        }
        Ok(())
    }

    /// Release an entire address space: all task-half mappings, then the
    /// root node itself. Shared kernel slots are left alone.
    pub fn free_page_map<const W: usize>(
        &mut self,
        root: NodeHandle,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<(), MemoryError> {
        self.clean_page_maps(root, VirtualAddress(USER_ADDRESS_BASE), frames)?;
        self.free_node(root, frames)
    }

    /// Clone the subtree of `src` into `dest` from `start_index` on at the
    /// given level.
    ///
    /// Policy: full deep copy. Intermediate nodes are duplicated and leaf
    /// frame contents are copied into freshly allocated frames, so nothing
    /// in the task half is shared between address spaces.
    pub fn copy_page_maps<const W: usize>(
        &mut self,
        dest: NodeHandle,
        src: NodeHandle,
        level: u8,
        start_index: usize,
        frames: &mut BitmapFrameAllocator<W>,
    ) -> Result<(), MemoryError> {
        for index in start_index..ENTRIES_PER_NODE {
            let entry = self.node(src)?.entry(index);
            if !entry.is_present() {
                continue;
            }

            if level == 1 || entry.is_huge() {
                let copy = frames.allocate(1)?;
                super::copy_frame_contents(entry.mapped_frame(), copy);
                self.node_mut(dest)?
                    .set_entry(index, PageMapEntry::frame(copy, entry.attr()));
            } else {
                let child = self.new_page_map(frames)?;
                self.copy_page_maps(child, entry.child_handle(), level - 1, 0, frames)?;
                self.node_mut(dest)?
                    .set_entry(index, PageMapEntry::child(child, entry.attr()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestFrames = BitmapFrameAllocator<64>; // 4096 frames

    fn arena_with_frames() -> (PageMapArena, TestFrames) {
        let mut frames = TestFrames::new();
        frames.set_memory_range(FrameId(0), FrameId(4096));
        (PageMapArena::new(), frames)
    }

    const USER_ADDR: VirtualAddress = VirtualAddress(0xFFFF_8000_0000_0000);

    #[test]
    fn test_part_extraction() {
        let addr = VirtualAddress(0xFFFF_8000_0000_0000);
        assert_eq!(addr.part(4), 256);
        assert_eq!(addr.part(3), 0);
        assert_eq!(addr.part(2), 0);
        assert_eq!(addr.part(1), 0);

        let addr = VirtualAddress(0x0000_0000_0020_1000);
        assert_eq!(addr.part(2), 1);
        assert_eq!(addr.part(1), 1);
    }

    #[test]
    fn test_setup_then_translate_round_trip() {
        let (mut arena, mut frames) = arena_with_frames();
        let root = arena.new_page_map(&mut frames).unwrap();

        arena
            .setup_page_maps(root, USER_ADDR, 3, true, &mut frames)
            .unwrap();

        for i in 0..3u64 {
            let va = VirtualAddress(USER_ADDR.0 + i * 4096 + 0x123);
            let t = arena.translate(root, va).expect("mapped page");
            assert!(t.writable);
            assert_eq!(t.phys_addr & 0xFFF, 0x123);
        }
        // Page just past the range is not mapped
        assert!(arena
            .translate(root, VirtualAddress(USER_ADDR.0 + 3 * 4096))
            .is_none());
    }

    #[test]
    fn test_partial_path_is_not_a_translation() {
        let (mut arena, mut frames) = arena_with_frames();
        let root = arena.new_page_map(&mut frames).unwrap();

        // Nothing mapped at all: the walk stops at the first absent level
        assert!(arena.translate(root, USER_ADDR).is_none());

        // Mapping one page must not make a sibling address translatable
        arena
            .setup_page_maps(root, USER_ADDR, 1, true, &mut frames)
            .unwrap();
        assert!(arena
            .translate(root, VirtualAddress(USER_ADDR.0 + 4096))
            .is_none());
    }

    #[test]
    fn test_clean_page_maps_unmaps_and_releases() {
        let (mut arena, mut frames) = arena_with_frames();
        let root = arena.new_page_map(&mut frames).unwrap();
        let before = frames.available_frames();

        arena
            .setup_page_maps(root, USER_ADDR, 4, true, &mut frames)
            .unwrap();
        assert!(frames.available_frames() < before);

        arena
            .clean_page_maps(root, USER_ADDR, &mut frames)
            .unwrap();
        assert!(arena.translate(root, USER_ADDR).is_none());
        // Every node and leaf frame below the cut came back
        assert_eq!(frames.available_frames(), before);
        assert_eq!(arena.node_count(), 1); // only the root remains
    }

    #[test]
    fn test_clean_does_not_touch_identity_half() {
        let (mut arena, mut frames) = arena_with_frames();
        let root = arena.new_page_map(&mut frames).unwrap();

        // A small identity mapping in the kernel half
        let pdp = arena.new_page_map(&mut frames).unwrap();
        let pd = arena.new_page_map(&mut frames).unwrap();
        arena
            .node_mut(pd)
            .unwrap()
            .set_entry(0, PageMapEntry::frame(
                FrameId(0),
                PageAttr::PRESENT | PageAttr::WRITABLE | PageAttr::HUGE,
            ));
        arena
            .node_mut(pdp)
            .unwrap()
            .set_entry(0, PageMapEntry::child(pd, PageAttr::PRESENT | PageAttr::WRITABLE));
        arena
            .node_mut(root)
            .unwrap()
            .set_entry(0, PageMapEntry::child(pdp, PageAttr::PRESENT | PageAttr::WRITABLE));

        arena
            .clean_page_maps(root, VirtualAddress(0), &mut frames)
            .unwrap();

        // The identity translation survives a full clean
        let t = arena.translate(root, VirtualAddress(0x1000)).unwrap();
        assert_eq!(t.phys_addr, 0x1000);
    }

    #[test]
    fn test_copy_page_maps_deep_copies() {
        let (mut arena, mut frames) = arena_with_frames();
        let src = arena.new_page_map(&mut frames).unwrap();
        arena
            .setup_page_maps(src, USER_ADDR, 2, true, &mut frames)
            .unwrap();

        let dest = arena.new_page_map(&mut frames).unwrap();
        arena
            .copy_page_maps(dest, src, 4, USER_PML4_START, &mut frames)
            .unwrap();

        let t_src = arena.translate(src, USER_ADDR).unwrap();
        let t_dest = arena.translate(dest, USER_ADDR).unwrap();
        // Same shape, different leaf frames: nothing shared
        assert_eq!(t_src.writable, t_dest.writable);
        assert_ne!(t_src.phys_addr, t_dest.phys_addr);
    }

    #[test]
    fn test_node_allocation_charges_frames() {
        let (mut arena, mut frames) = arena_with_frames();
        let before = frames.available_frames();
        let _root = arena.new_page_map(&mut frames).unwrap();
        assert_eq!(frames.available_frames(), before - 1);
    }

    #[test]
    fn test_new_page_map_out_of_memory() {
        let mut arena = PageMapArena::new();
        let mut frames = TestFrames::new();
        frames.set_memory_range(FrameId(0), FrameId(0));
        assert_eq!(
            arena.new_page_map(&mut frames).unwrap_err(),
            MemoryError::NoEnoughMemory
        );
    }

    #[test]
    fn test_address_space_shares_kernel_half() {
        let (mut arena, mut frames) = arena_with_frames();
        let kernel_root = arena.new_page_map(&mut frames).unwrap();
        let pdp = arena.new_page_map(&mut frames).unwrap();
        arena
            .node_mut(pdp)
            .unwrap()
            .set_entry(0, PageMapEntry::frame(
                FrameId(0),
                PageAttr::PRESENT | PageAttr::WRITABLE | PageAttr::HUGE,
            ));
        arena
            .node_mut(kernel_root)
            .unwrap()
            .set_entry(0, PageMapEntry::child(pdp, PageAttr::PRESENT | PageAttr::WRITABLE));

        let space = arena.new_address_space(kernel_root, &mut frames).unwrap();
        // Same identity subtree is visible through the new root
        assert_eq!(
            arena.node(space).unwrap().entry(0),
            arena.node(kernel_root).unwrap().entry(0)
        );
    }
}
