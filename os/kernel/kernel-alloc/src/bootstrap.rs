//! # Bootstrap Window
//!
//! Before the direct map exists, the kernel reaches arbitrary physical memory
//! through a single 2 MiB virtual window. The loader hands over one page
//! directory (L2 table) that covers the window's virtual address. Rewriting
//! the window's entry in that directory slides the window over a different
//! 2 MiB-aligned physical region.
//!
//! ```text
//!   BOOTSTRAP_WINDOW ──► L2[index] = PS | P | RW | NX ──► 2 MiB region containing pa
//!                             ▲
//!                             └── rewritten by map_temporary when pa leaves the region
//! ```
//!
//! Only one region is visible at a time. Every pointer or reference obtained
//! from the window is invalidated by the next request for a different region,
//! which is exactly the [`PhysMapper`] contract page-table code follows.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::NonNull;
use kernel_info::memory::BOOTSTRAP_WINDOW;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, VirtualAddress};
use kernel_vmem::{Mmu, PageTable, PageTableEntry, PageTableIndex, PageTableLevel, PhysMapper};
use log::trace;

/// A sliding 2 MiB window onto physical memory.
///
/// Not `Sync`: the window position is shared mutable state and callers must
/// serialize access (the kernel does so with its interrupt lock).
pub struct BootstrapMapper<'t, U: Mmu> {
    directory: NonNull<PageTable>,
    slot: PageTableIndex,
    window: VirtualAddress,
    current: Cell<Option<PhysicalPage<Size2M>>>,
    mmu: U,
    _directory: PhantomData<&'t mut PageTable>,
}

impl<'t, U: Mmu> BootstrapMapper<'t, U> {
    /// Use the kernel's fixed [`BOOTSTRAP_WINDOW`].
    ///
    /// # Safety
    /// See [`with_window`](Self::with_window).
    pub unsafe fn new(directory: &'t mut PageTable, mmu: U) -> Self {
        unsafe { Self::with_window(directory, VirtualAddress::new(BOOTSTRAP_WINDOW), mmu) }
    }

    /// Take over the entry for `window` in `directory`.
    ///
    /// # Safety
    /// - `directory` must be the live L2 table translating `window`.
    /// - `window` must be 2 MiB aligned and reserved for this mapper; its
    ///   current entry is discarded.
    pub unsafe fn with_window(directory: &'t mut PageTable, window: VirtualAddress, mmu: U) -> Self {
        debug_assert!(window.is_aligned::<Size2M>());
        let slot = PageTableLevel::L2.index_of(window);
        directory.set(slot, PageTableEntry::empty());

        Self {
            directory: NonNull::from(directory),
            slot,
            window,
            current: Cell::new(None),
            mmu,
            _directory: PhantomData,
        }
    }

    /// Make `pa` addressable and return a pointer to it.
    ///
    /// The window covers the whole 2 MiB region around `pa`, so the pointer
    /// stays usable for the rest of that region until the next call that
    /// moves the window. Requests inside the current region neither touch the
    /// directory nor flush the TLB.
    #[allow(clippy::cast_possible_truncation)]
    pub fn map_temporary(&self, pa: PhysicalAddress) -> NonNull<u8> {
        let (region, offset) = pa.split::<Size2M>();

        if self.current.get() != Some(region) {
            // SAFETY: we hold the directory exclusively for 't; the reference
            // does not escape this statement.
            unsafe { (*self.directory.as_ptr()).set(self.slot, PageTableEntry::leaf_2m(region)) };
            self.mmu.flush_all();
            self.current.set(Some(region));
            trace!("bootstrap window moved to {region}");
        }

        let base = self.mmu.resolve(self.window, region.base());
        // SAFETY: the offset is below 2 MiB, inside the mapped window, and
        // the window base is never null.
        unsafe { NonNull::new_unchecked(base.add(offset.as_u64() as usize)) }
    }

    /// The 2 MiB region the window shows, if any.
    #[must_use]
    pub fn mapped_region(&self) -> Option<PhysicalPage<Size2M>> {
        self.current.get()
    }

    /// The directory entry currently backing the window.
    #[must_use]
    pub fn window_entry(&self) -> PageTableEntry {
        // SAFETY: shared read of the exclusively held directory.
        unsafe { self.directory.as_ref() }.get(self.slot)
    }

    #[must_use]
    pub const fn window(&self) -> VirtualAddress {
        self.window
    }

    /// Close the window.
    pub fn unmap(&self) {
        if self.current.take().is_some() {
            // SAFETY: as in `map_temporary`.
            unsafe { (*self.directory.as_ptr()).set(self.slot, PageTableEntry::empty()) };
            self.mmu.flush_all();
        }
    }
}

impl<U: Mmu> PhysMapper for BootstrapMapper<'_, U> {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(
            pa.offset::<Size2M>().as_u64() + size_of::<T>() as u64 <= Size2M::SIZE,
            "object at {pa} crosses the bootstrap window"
        );
        // SAFETY: the caller guarantees a valid `T` at `pa` and drops the
        // reference before the window moves.
        unsafe { &mut *self.map_temporary(pa).cast::<T>().as_ptr() }
    }
}
