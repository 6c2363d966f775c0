//! # Address Space (x86-64, four-level)
//!
//! One tree of page tables rooted at a single frame. Every tree shares the
//! kernel half: Root slot 511 of every space points at the same L3 table,
//! created together with the kernel space, so kernel mappings made through
//! any space are visible in all of them.
//!
//! ## Highlights
//!
//! - [`AddressSpace::new_kernel`] / [`AddressSpace::create`] build the kernel
//!   space and process spaces.
//! - [`AddressSpace::map_page`] installs one 4 KiB mapping, allocating zeroed
//!   intermediate tables on the way. If allocation fails midway, the tables
//!   this call created are unlinked and freed again.
//! - [`AddressSpace::unmap_page`] clears one mapping, invalidates the TLB
//!   entry, and hands the frame back to the caller.
//! - [`AddressSpace::destroy`] frees everything outside the kernel half with
//!   a bounded worklist instead of recursion.
//! - [`AddressSpace::find_free_range`] looks for unmapped virtual runs,
//!   treating missing tables as entirely free.
//!
//! ## Mapper discipline
//!
//! The [`PhysMapper`] may serve every request through one virtual window.
//! All table accesses here go through [`read`](AddressSpace::read) and
//! [`write`](AddressSpace::write), which never keep a table reference alive
//! across another mapper call.

use crate::page_table::{PageFlags, PageTableEntry, PageTableIndex, PageTableLevel, TableIndices};
use crate::{FrameAlloc, FreeFrameError, Mmu, PhysMapper, table_mut};
use kernel_info::memory::{KERNEL_HALF_BASE, LOWER_HALF_END, UPPER_HALF_START, USER_SPACE_START};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use log::{debug, error, trace, warn};

/// The root table frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Which role an address space plays.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpaceKind {
    /// The single kernel space; owns the shared kernel half.
    Kernel,
    /// A process space; may not map into the kernel half.
    Process,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical frames for page tables")]
    OutOfMemory,
    #[error("virtual page is already mapped")]
    AlreadyMapped,
    #[error("process address spaces may not map into the kernel half")]
    KernelHalf,
    #[error("virtual or physical address is not 4 KiB aligned")]
    Unaligned,
    #[error("virtual address is not canonical")]
    NonCanonical,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    #[error("virtual page is not mapped")]
    NotMapped,
    #[error("virtual page is covered by a 2 MiB or 1 GiB leaf")]
    LargePage,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CreateError {
    #[error("out of physical frames for the root table")]
    OutOfMemory,
}

/// Handle to a single, concrete address space.
///
/// Not `Clone`: [`destroy`](Self::destroy) consumes the handle, after which
/// its root frame belongs to the frame allocator again.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    kind: SpaceKind,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Build the kernel space: a zeroed root whose slot 511 links a zeroed,
    /// shared kernel L3 table.
    ///
    /// # Errors
    /// [`CreateError::OutOfMemory`] if either frame cannot be allocated.
    pub fn new_kernel<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, CreateError> {
        let root = alloc_zeroed_table(mapper, alloc).ok_or(CreateError::OutOfMemory)?;
        let Some(kernel_l3) = alloc_zeroed_table(mapper, alloc) else {
            release_frame(alloc, root);
            return Err(CreateError::OutOfMemory);
        };

        let space = Self {
            root,
            kind: SpaceKind::Kernel,
            mapper,
        };
        space.write(root, PageTableIndex::KERNEL_SLOT, PageTableEntry::table(kernel_l3, false));

        debug!("kernel address space created: root {root}, kernel L3 {kernel_l3}");
        Ok(space)
    }

    /// Create a process space sharing `kernel`'s kernel half.
    ///
    /// # Errors
    /// [`CreateError::OutOfMemory`] if no frame is left for the root.
    pub fn create<A: FrameAlloc>(kernel: &Self, alloc: &mut A) -> Result<Self, CreateError> {
        debug_assert_eq!(kernel.kind, SpaceKind::Kernel);

        let shared = kernel.read(kernel.root, PageTableIndex::KERNEL_SLOT);
        let root = alloc_zeroed_table(kernel.mapper, alloc).ok_or(CreateError::OutOfMemory)?;

        let space = Self {
            root,
            kind: SpaceKind::Process,
            mapper: kernel.mapper,
        };
        space.write(root, PageTableIndex::KERNEL_SLOT, shared);

        debug!("process address space created: root {root}");
        Ok(space)
    }

    /// View an existing tree rooted at `root`.
    ///
    /// # Safety
    /// `root` must be a valid top-level table whose slot 511 links the shared
    /// kernel L3, and for [`SpaceKind::Process`] no other handle may
    /// [`destroy`](Self::destroy) the same tree.
    #[inline]
    pub const unsafe fn from_root(mapper: &'m M, root: RootPage, kind: SpaceKind) -> Self {
        Self { root, kind, mapper }
    }

    /// View the **currently active** address space.
    ///
    /// # Safety
    /// Same as [`from_root`](Self::from_root) for the root loaded in `mmu`.
    #[inline]
    pub unsafe fn from_current<U: Mmu>(mapper: &'m M, mmu: &U, kind: SpaceKind) -> Self {
        unsafe { Self::from_root(mapper, mmu.current_root(), kind) }
    }

    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Load this space's root, unless it already is the active one.
    ///
    /// Returns `true` if the root was reloaded.
    pub fn activate<U: Mmu>(&self, mmu: &U) -> bool {
        if self.is_active(mmu) {
            return false;
        }

        trace!("switching address space to root {}", self.root);
        // SAFETY: every space carries the shared kernel half, so kernel code,
        // stacks and data stay mapped across the switch.
        unsafe { mmu.load_root(self.root) };
        true
    }

    #[inline]
    #[must_use]
    pub fn is_active<U: Mmu>(&self, mmu: &U) -> bool {
        mmu.current_root() == self.root
    }

    /// Map the 4 KiB page at `va` to the frame at `pa`.
    ///
    /// Intermediate tables are created zeroed and linked present + writable
    /// (+ user outside the kernel half). The leaf takes its permissions from
    /// `flags`; non-executable pages get NX.
    ///
    /// # Errors
    /// - [`MapError::AlreadyMapped`] if a leaf already translates `va`; the
    ///   existing mapping is left untouched.
    /// - [`MapError::KernelHalf`] for a process space mapping into slot 511.
    /// - [`MapError::OutOfMemory`] if a table frame cannot be allocated; the
    ///   tables created by this call are freed again.
    /// - [`MapError::Unaligned`] / [`MapError::NonCanonical`] for bad input.
    pub fn map_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned);
        }
        if !va.is_canonical() {
            return Err(MapError::NonCanonical);
        }

        let idx = TableIndices::of(va);
        if idx.is_kernel_half() && self.kind == SpaceKind::Process {
            return Err(MapError::KernelHalf);
        }

        let user_half = !idx.is_kernel_half();
        let mut created = CreatedTables::default();
        let mut table = self.root;

        for level in [PageTableLevel::Root, PageTableLevel::L3, PageTableLevel::L2] {
            let i = idx.get(level);
            let entry = self.read(table, i);

            table = if let Some(next) = entry.next_table() {
                next
            } else if entry.present() {
                // A large leaf already covers `va`.
                return Err(MapError::AlreadyMapped);
            } else {
                let Some(frame) = alloc_zeroed_table(self.mapper, alloc) else {
                    warn!("out of frames mapping {va}");
                    self.unlink_created(alloc, &created);
                    return Err(MapError::OutOfMemory);
                };
                self.write(table, i, PageTableEntry::table(frame, user_half));
                created.push(table, i, frame);
                frame
            };
        }

        if self.read(table, idx.l1).present() {
            debug_assert!(created.is_empty());
            return Err(MapError::AlreadyMapped);
        }

        self.write(table, idx.l1, PageTableEntry::leaf_4k(pa.page::<Size4K>(), flags));
        trace!("mapped {va} -> {pa} ({flags:?})");
        Ok(())
    }

    /// Remove the 4 KiB mapping for `va`, invalidate its TLB entry, and
    /// return the frame it pointed to. Intermediate tables stay in place.
    ///
    /// Only 4 KiB leaves are removed; large leaves are left untouched.
    ///
    /// # Errors
    /// - [`UnmapError::NotMapped`] if `va` is not mapped at any level.
    /// - [`UnmapError::LargePage`] if a 2 MiB or 1 GiB leaf translates `va`.
    pub fn unmap_page<U: Mmu>(&self, va: VirtualAddress, mmu: &U) -> Result<PhysicalPage<Size4K>, UnmapError> {
        if !va.is_canonical() {
            return Err(UnmapError::NotMapped);
        }

        let idx = TableIndices::of(va);
        let mut l1 = self.root;
        for level in [PageTableLevel::Root, PageTableLevel::L3, PageTableLevel::L2] {
            let entry = self.read(l1, idx.get(level));
            l1 = match entry.next_table() {
                Some(next) => next,
                None if entry.present() => return Err(UnmapError::LargePage),
                None => return Err(UnmapError::NotMapped),
            };
        }
        let leaf = self.read(l1, idx.l1);
        if !leaf.present() {
            return Err(UnmapError::NotMapped);
        }

        self.write(l1, idx.l1, PageTableEntry::empty());
        mmu.invalidate_page(va);

        trace!("unmapped {va} (was {})", leaf.frame());
        Ok(leaf.frame())
    }

    /// Translate `va` to the physical address it maps to, if any.
    ///
    /// Honors 2 MiB (and 1 GiB) leaves by adding the in-page offset.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !va.is_canonical() {
            return None;
        }

        let idx = TableIndices::of(va);
        let mut table = self.root;
        for level in PageTableLevel::ALL {
            let entry = self.read(table, idx.get(level));
            if !entry.present() {
                return None;
            }

            let is_leaf = level == PageTableLevel::L1 || (level != PageTableLevel::Root && entry.large_page());
            if is_leaf {
                let mask = level.span() - 1;
                let base = entry.physical_address().as_u64() & !mask;
                return Some(PhysicalAddress::new(base | (va.as_u64() & mask)));
            }
            table = entry.frame();
        }
        None
    }

    /// Release every frame of this space outside the kernel half: leaf
    /// frames, intermediate tables, and finally the root.
    ///
    /// The walk uses an explicit worklist bounded by the tree depth. Leaves
    /// may point at frames the allocator never handed out (device memory);
    /// those are skipped with a warning. A table frame the allocator refuses
    /// is an invariant breach: it is logged and asserted in debug builds, and
    /// teardown continues.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) {
        if self.kind == SpaceKind::Kernel {
            warn!("destroying the kernel address space; the shared kernel half is kept");
        }

        let mut worklist = Worklist::new(Cursor::new(self.root, PageTableLevel::Root));
        let mut freed = 0_usize;

        while let Some(top) = worklist.top_mut() {
            let limit = if top.level == PageTableLevel::Root {
                PageTableIndex::KERNEL_SLOT.as_u16()
            } else {
                PageTableIndex::COUNT
            };

            if top.next >= limit {
                let done = *top;
                worklist.pop();
                release_frame(alloc, done.table);
                freed += 1;
                continue;
            }

            let i = PageTableIndex::new(top.next);
            top.next += 1;
            let (table, level) = (top.table, top.level);

            let entry = self.read(table, i);
            if !entry.present() {
                continue;
            }

            match level.next() {
                Some(child) if !entry.large_page() => {
                    worklist.push(Cursor::new(entry.frame(), child));
                }
                Some(_) => {
                    error!("large page at {level:?} index {} in process space, not freed", i.as_u16());
                }
                None => {
                    if release_leaf(alloc, entry.frame()) {
                        freed += 1;
                    }
                }
            }
        }

        debug!("address space {} destroyed, {freed} frames released", self.root);
    }

    /// Find `pages` consecutive unmapped pages in the private half of this
    /// space, lowest address first.
    ///
    /// The lower half is searched from `USER_SPACE_START`, then the upper half
    /// below the kernel slot. The non-canonical hole between them breaks any
    /// run.
    #[must_use]
    pub fn find_free_range(&self, pages: usize) -> Option<VirtualAddress> {
        self.find_free_range_in(pages, VirtualAddress::new(USER_SPACE_START), VirtualAddress::new(LOWER_HALF_END))
            .or_else(|| {
                self.find_free_range_in(
                    pages,
                    VirtualAddress::new(UPPER_HALF_START),
                    VirtualAddress::new(KERNEL_HALF_BASE),
                )
            })
    }

    /// Find `pages` consecutive unmapped pages within `[start, end)`.
    ///
    /// Missing intermediate tables count as entirely free sub-ranges, so the
    /// search skips whole unpopulated regions in one step.
    #[must_use]
    pub fn find_free_range_in(&self, pages: usize, start: VirtualAddress, end: VirtualAddress) -> Option<VirtualAddress> {
        if pages == 0 {
            return None;
        }

        let needed = (pages as u64).checked_mul(Size4K::SIZE)?;
        let end = end.as_u64() & !(Size4K::SIZE - 1);
        let mut cursor = start.as_u64().checked_add(Size4K::SIZE - 1)? & !(Size4K::SIZE - 1);
        let mut run_start = cursor;

        while cursor < end {
            let (free, span_end) = self.probe(VirtualAddress::new(cursor));
            cursor = span_end.min(end);

            if !free {
                run_start = cursor;
            } else if cursor - run_start >= needed {
                return Some(VirtualAddress::new(run_start));
            }
        }
        None
    }

    /// Classify the largest aligned region starting at `va` that shares one
    /// translation fate; returns `(is_free, exclusive_end)`.
    fn probe(&self, va: VirtualAddress) -> (bool, u64) {
        let idx = TableIndices::of(va);
        let mut table = self.root;

        for level in PageTableLevel::ALL {
            let span = level.span();
            let span_end = (va.as_u64() & !(span - 1)).saturating_add(span);

            let entry = self.read(table, idx.get(level));
            if !entry.present() {
                return (true, span_end);
            }

            match entry.next_table() {
                Some(next) if level != PageTableLevel::L1 => table = next,
                _ => return (false, span_end),
            }
        }

        (false, va.as_u64().saturating_add(Size4K::SIZE))
    }

    /// Frame of the L1 table covering `idx`, if the whole chain exists.
    #[cfg(test)]
    fn walk_to_l1(&self, idx: &TableIndices) -> Option<PhysicalPage<Size4K>> {
        let l3 = self.read(self.root, idx.root).next_table()?;
        let l2 = self.read(l3, idx.l3).next_table()?;
        self.read(l2, idx.l2).next_table()
    }

    /// Undo the table links a failed [`map_page`](Self::map_page) created,
    /// deepest first.
    fn unlink_created<A: FrameAlloc>(&self, alloc: &mut A, created: &CreatedTables) {
        for &(parent, index, frame) in created.iter().rev() {
            self.write(parent, index, PageTableEntry::empty());
            release_frame(alloc, frame);
        }
    }

    /// Load the entry `i` of `table`.
    #[inline]
    fn read(&self, table: PhysicalPage<Size4K>, i: PageTableIndex) -> PageTableEntry {
        // SAFETY: `table` is part of this tree; the reference dies here.
        unsafe { table_mut(self.mapper, table) }.get(i)
    }

    /// Store `e` into entry `i` of `table`.
    #[inline]
    fn write(&self, table: PhysicalPage<Size4K>, i: PageTableIndex, e: PageTableEntry) {
        // SAFETY: `table` is part of this tree; the reference dies here.
        unsafe { table_mut(self.mapper, table) }.set(i, e);
    }
}

/// Allocate a frame and clear it so it reads as an empty table.
fn alloc_zeroed_table<M: PhysMapper, A: FrameAlloc>(mapper: &M, alloc: &mut A) -> Option<PhysicalPage<Size4K>> {
    let frame = alloc.alloc_4k()?;
    // SAFETY: the frame was just handed to us and is not referenced elsewhere.
    unsafe { table_mut(mapper, frame) }.zero();
    Some(frame)
}

/// Hand a frame back; a refusal means bookkeeping is already broken.
fn release_frame<A: FrameAlloc>(alloc: &mut A, frame: PhysicalPage<Size4K>) {
    let result = alloc.free_4k(frame);
    if let Err(err) = result {
        error!("frame release refused: {err}");
    }
    debug_assert!(result.is_ok(), "frame release refused for {frame}");
}

/// Hand a leaf frame back unless the allocator does not manage it.
fn release_leaf<A: FrameAlloc>(alloc: &mut A, frame: PhysicalPage<Size4K>) -> bool {
    match alloc.free_4k(frame) {
        Ok(()) => true,
        Err(FreeFrameError::NotAllocated(_)) => {
            warn!("leaf frame {frame} is not managed by the frame allocator, skipped");
            false
        }
        Err(err) => {
            error!("frame release refused: {err}");
            false
        }
    }
}

/// Tables linked by one `map_page` call: `(parent, index, frame)`.
#[derive(Default)]
struct CreatedTables {
    items: [Option<(PhysicalPage<Size4K>, PageTableIndex, PhysicalPage<Size4K>)>; 3],
    len: usize,
}

impl CreatedTables {
    fn push(&mut self, parent: PhysicalPage<Size4K>, index: PageTableIndex, frame: PhysicalPage<Size4K>) {
        self.items[self.len] = Some((parent, index, frame));
        self.len += 1;
    }

    const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = &(PhysicalPage<Size4K>, PageTableIndex, PhysicalPage<Size4K>)> {
        self.items[..self.len].iter().flatten()
    }
}

/// Position inside one table during teardown.
#[derive(Copy, Clone)]
struct Cursor {
    table: PhysicalPage<Size4K>,
    level: PageTableLevel,
    next: u16,
}

impl Cursor {
    const fn new(table: PhysicalPage<Size4K>, level: PageTableLevel) -> Self {
        Self { table, level, next: 0 }
    }
}

/// Fixed-capacity stack, one slot per paging level.
struct Worklist {
    items: [Option<Cursor>; 4],
    len: usize,
}

impl Worklist {
    fn new(root: Cursor) -> Self {
        Self {
            items: [Some(root), None, None, None],
            len: 1,
        }
    }

    fn top_mut(&mut self) -> Option<&mut Cursor> {
        let top = self.len.checked_sub(1)?;
        self.items[top].as_mut()
    }

    fn push(&mut self, cursor: Cursor) {
        self.items[self.len] = Some(cursor);
        self.len += 1;
    }

    fn pop(&mut self) {
        if let Some(top) = self.len.checked_sub(1) {
            self.items[top] = None;
            self.len = top;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedMmu, SimulatedRam, VecFrameAlloc};

    const KERNEL_VA: VirtualAddress = VirtualAddress::new(0xFFFF_FFFF_8020_0000);

    fn setup(frames: usize) -> (SimulatedRam, VecFrameAlloc) {
        // Frame 0 stays out of the pool.
        (SimulatedRam::new(frames), VecFrameAlloc::new(1, frames - 1))
    }

    #[test]
    fn map_then_translate() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x0000_0000_0040_0000);
        let pa = PhysicalAddress::new(0x0003_0000);
        space.map_page(&mut alloc, va, pa, PageFlags::KERNEL_DATA.user()).unwrap();

        assert_eq!(space.translate(va + 0x123), Some(pa + 0x123));
        assert_eq!(space.translate(va + 0x1000), None);
        assert_eq!(kernel.translate(va), None, "private half is not shared");
    }

    #[test]
    fn leaf_permissions_follow_flags() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x7000);
        space
            .map_page(&mut alloc, va, PhysicalAddress::new(0x5000), PageFlags::new(false, false))
            .unwrap();

        let idx = TableIndices::of(va);
        let l1 = space.walk_to_l1(&idx).unwrap();
        let leaf = space.read(l1, idx.l1);
        assert!(leaf.present());
        assert!(!leaf.writable());
        assert!(leaf.no_execute());

        let root_entry = space.read(space.root_page(), idx.root);
        assert!(root_entry.present() && root_entry.writable() && root_entry.user());
    }

    #[test]
    fn remapping_is_rejected_without_side_effects() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x0000_1234_5678_9000);
        let first = PhysicalAddress::new(0x9000);
        space.map_page(&mut alloc, va, first, PageFlags::KERNEL_DATA).unwrap();
        let used = alloc.allocated_count();

        let err = space.map_page(&mut alloc, va, PhysicalAddress::new(0xA000), PageFlags::KERNEL_DATA);
        assert_eq!(err, Err(MapError::AlreadyMapped));
        assert_eq!(space.translate(va), Some(first));
        assert_eq!(alloc.allocated_count(), used);
    }

    #[test]
    fn unmap_returns_frame_and_invalidates() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let mmu = SimulatedMmu::new(&ram, kernel.root_page());

        let va = KERNEL_VA;
        let frame = alloc.alloc_4k().unwrap();
        kernel.map_page(&mut alloc, va, frame.base(), PageFlags::KERNEL_DATA).unwrap();

        assert_eq!(kernel.unmap_page(va, &mmu), Ok(frame));
        assert_eq!(kernel.translate(va), None);
        assert_eq!(mmu.invalidations(), [va]);
        assert_eq!(kernel.unmap_page(va, &mmu), Err(UnmapError::NotMapped));
        assert_eq!(
            kernel.unmap_page(VirtualAddress::new(0x4000_0000), &mmu),
            Err(UnmapError::NotMapped)
        );
    }

    #[test]
    fn process_space_cannot_touch_kernel_half() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();

        let err = space.map_page(&mut alloc, KERNEL_VA, PhysicalAddress::new(0x1000), PageFlags::KERNEL_DATA);
        assert_eq!(err, Err(MapError::KernelHalf));
    }

    #[test]
    fn kernel_half_is_shared_both_ways() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let early = AddressSpace::create(&kernel, &mut alloc).unwrap();

        let pa = PhysicalAddress::new(0x0010_0000);
        kernel.map_page(&mut alloc, KERNEL_VA, pa, PageFlags::KERNEL_DATA).unwrap();
        let late = AddressSpace::create(&kernel, &mut alloc).unwrap();

        assert_eq!(early.translate(KERNEL_VA), Some(pa));
        assert_eq!(late.translate(KERNEL_VA), Some(pa));
    }

    #[test]
    fn failed_map_releases_new_tables() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();
        let before = alloc.allocated_count();

        // Room for the L3 and L2 tables, not for the L1.
        alloc.set_budget(Some(2));
        let va = VirtualAddress::new(0x0000_0040_0000_0000);
        let err = space.map_page(&mut alloc, va, PhysicalAddress::new(0x3000), PageFlags::KERNEL_DATA);
        assert_eq!(err, Err(MapError::OutOfMemory));
        assert_eq!(alloc.allocated_count(), before);

        let idx = TableIndices::of(va);
        assert!(space.read(space.root_page(), idx.root).is_empty());

        alloc.set_budget(None);
        space.map_page(&mut alloc, va, PhysicalAddress::new(0x3000), PageFlags::KERNEL_DATA).unwrap();
        assert_eq!(space.translate(va), Some(PhysicalAddress::new(0x3000)));
    }

    #[test]
    fn create_fails_cleanly_when_exhausted() {
        let (ram, mut alloc) = setup(8);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        alloc.set_budget(Some(0));
        assert!(matches!(AddressSpace::create(&kernel, &mut alloc), Err(CreateError::OutOfMemory)));

        let (ram, mut alloc) = setup(8);
        alloc.set_budget(Some(1));
        assert!(matches!(AddressSpace::new_kernel(&ram, &mut alloc), Err(CreateError::OutOfMemory)));
        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn destroy_releases_everything_but_the_kernel_half() {
        let (ram, mut alloc) = setup(128);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let kernel_frame = alloc.alloc_4k().unwrap();
        kernel.map_page(&mut alloc, KERNEL_VA, kernel_frame.base(), PageFlags::KERNEL_DATA).unwrap();
        let baseline = alloc.allocated_count();

        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();
        for va in [0x1000_u64, 0x2000, 0x0000_0040_0000_0000, 0xFFFF_8000_0000_0000] {
            let frame = alloc.alloc_4k().unwrap();
            space
                .map_page(&mut alloc, VirtualAddress::new(va), frame.base(), PageFlags::KERNEL_DATA.user())
                .unwrap();
        }
        assert!(alloc.allocated_count() > baseline);

        space.destroy(&mut alloc);
        assert_eq!(alloc.allocated_count(), baseline);
        assert_eq!(kernel.translate(KERNEL_VA), Some(kernel_frame.base()));
    }

    #[test]
    fn destroy_skips_unmanaged_leaf_frames() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let baseline = alloc.allocated_count();

        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();
        // Frame 0 is outside the pool, like a device page.
        space
            .map_page(&mut alloc, VirtualAddress::new(0x1000), PhysicalAddress::new(0), PageFlags::KERNEL_DATA.user())
            .unwrap();
        let owned = alloc.alloc_4k().unwrap();
        space
            .map_page(&mut alloc, VirtualAddress::new(0x2000), owned.base(), PageFlags::KERNEL_DATA.user())
            .unwrap();

        space.destroy(&mut alloc);
        assert_eq!(alloc.allocated_count(), baseline);
    }

    #[test]
    fn free_range_skips_mapped_pages() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();

        assert_eq!(space.find_free_range(4), Some(VirtualAddress::new(USER_SPACE_START)));

        let blocker = VirtualAddress::new(USER_SPACE_START + 2 * 0x1000);
        space.map_page(&mut alloc, blocker, PhysicalAddress::new(0x8000), PageFlags::KERNEL_DATA).unwrap();

        assert_eq!(space.find_free_range(2), Some(VirtualAddress::new(USER_SPACE_START)));
        assert_eq!(space.find_free_range(3), Some(blocker + 0x1000));
        assert_eq!(space.find_free_range(0), None);
    }

    #[test]
    fn free_range_spans_missing_tables() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();

        // 1 GiB worth of pages fits in the untouched lower half.
        let pages = 1 << 18;
        assert_eq!(space.find_free_range(pages), Some(VirtualAddress::new(USER_SPACE_START)));

        let start = VirtualAddress::new(KERNEL_VA.as_u64());
        let end = start + 4 * 0x1000;
        kernel.map_page(&mut alloc, start + 0x1000, PhysicalAddress::new(0x2000), PageFlags::KERNEL_DATA).unwrap();
        assert_eq!(kernel.find_free_range_in(2, start, end), Some(start + 0x2000));
        assert_eq!(kernel.find_free_range_in(3, start, end), None);
    }

    #[test]
    fn translate_honors_large_pages() {
        let (ram, mut alloc) = setup(64);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();

        // Build the chain with a 4K mapping, then replace its L2 link by a 2 MiB leaf.
        let va = VirtualAddress::new(0x0000_0000_4000_0000);
        space.map_page(&mut alloc, va, PhysicalAddress::new(0x1000), PageFlags::KERNEL_DATA).unwrap();
        let idx = TableIndices::of(va);
        let l3 = space.read(space.root_page(), idx.root).frame();
        let l2 = space.read(l3, idx.l3).frame();
        let large = PhysicalAddress::new(0x0060_0000).page();
        space.write(l2, idx.l2, PageTableEntry::leaf_2m(large));

        assert_eq!(space.translate(va + 0x12_3456), Some(PhysicalAddress::new(0x0072_3456)));
        assert_eq!(
            space.map_page(&mut alloc, va + 0x1000, PhysicalAddress::new(0x2000), PageFlags::KERNEL_DATA),
            Err(MapError::AlreadyMapped)
        );

        let mmu = SimulatedMmu::new(&ram, space.root_page());
        assert_eq!(space.unmap_page(va + 0x1000, &mmu), Err(UnmapError::LargePage));
        assert_eq!(space.translate(va), Some(PhysicalAddress::new(0x0060_0000)));
        assert!(mmu.invalidations().is_empty());
    }

    #[test]
    fn rejects_bad_addresses() {
        let (ram, mut alloc) = setup(16);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let flags = PageFlags::KERNEL_DATA;

        assert_eq!(
            kernel.map_page(&mut alloc, VirtualAddress::new(0x1001), PhysicalAddress::new(0x1000), flags),
            Err(MapError::Unaligned)
        );
        assert_eq!(
            kernel.map_page(&mut alloc, VirtualAddress::new(0x0000_8000_0000_0000), PhysicalAddress::new(0x1000), flags),
            Err(MapError::NonCanonical)
        );
        assert_eq!(kernel.translate(VirtualAddress::new(0x0000_8000_0000_0000)), None);
    }

    #[test]
    fn activate_only_reloads_on_change() {
        let (ram, mut alloc) = setup(16);
        let kernel = AddressSpace::new_kernel(&ram, &mut alloc).unwrap();
        let space = AddressSpace::create(&kernel, &mut alloc).unwrap();
        let mmu = SimulatedMmu::new(&ram, kernel.root_page());

        assert!(kernel.is_active(&mmu));
        assert!(!kernel.activate(&mmu));
        assert!(space.activate(&mmu));
        assert!(!space.activate(&mmu));
        assert!(space.is_active(&mmu));
        assert_eq!(mmu.load_count(), 1);

        let current = unsafe { AddressSpace::from_current(&ram, &mmu, SpaceKind::Process) };
        assert_eq!(current.root_page(), space.root_page());
    }
}
