//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel: page-table types, the seams to
//! the rest of the system, and per-process [`AddressSpace`]s.
//!
//! ## What you get
//! - [`PageTableEntry`] / [`PageTable`] in the hardware layout, addressed by
//!   typed [`PageTableIndex`]es.
//! - [`AddressSpace`]: create, map, unmap, translate, destroy and switch
//!   address spaces that all share the kernel half (Root slot 511).
//! - Seams to the rest of the kernel:
//!   - [`FrameAlloc`] hands out and takes back 4 KiB physical frames.
//!   - [`PhysMapper`] makes a physical frame temporarily addressable.
//!   - [`Mmu`] reads/loads the translation root and maintains the TLB.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//!  Root  →   L3   →   L2   →   L1   →  Physical Page
//!   │         │        │        │
//!   │         │        │        └───► maps 4 KiB page
//!   │         │        └────────────► PS=1 → 2 MiB page (bootstrap window only)
//!   │         └─────────────────────► next table
//!   └───────────────────────────────► next table; slot 511 shared by all spaces
//! ```
//!
//! With the `testing` feature, [`testing`] provides simulated RAM, MMU and a
//! frame pool so dependent crates can exercise paging on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

pub mod address_space;
pub mod mmu;
pub mod page_table;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::address_space::{AddressSpace, CreateError, MapError, SpaceKind, UnmapError};
#[cfg(target_arch = "x86_64")]
pub use crate::mmu::X86Mmu;
pub use crate::mmu::{Cr3, Mmu};
pub use crate::page_table::{
    PageFlags, PageTable, PageTableEntry, PageTableIndex, PageTableLevel, TableIndices,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Source and sink of **physical** 4 KiB frames.
///
/// Frames returned by [`alloc_4k`](Self::alloc_4k) are exclusively owned by
/// the caller until handed back through [`free_4k`](Self::free_4k). Their
/// contents are unspecified.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame, or `None` when exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously obtained from [`alloc_4k`](Self::alloc_4k).
    ///
    /// # Errors
    /// [`FreeFrameError::NotAllocated`] if the frame is not currently handed
    /// out (double free, or never owned by this allocator).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), FreeFrameError>;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), FreeFrameError> {
        (**self).free_4k(frame)
    }
}

/// Rejected frame release.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FreeFrameError {
    #[error("address {0} is not 4 KiB aligned")]
    Unaligned(PhysicalAddress),
    #[error("frame {0} is not currently allocated")]
    NotAllocated(PhysicalPage<Size4K>),
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (HHDM, identity map, or a bootstrap window).
///
/// A mapper may reuse a single virtual window for every call. Callers must
/// therefore treat a returned reference as dead once they call the mapper
/// again; the page-table code in this crate never holds two at once.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be backed by memory holding a valid `T`.
    /// - The reference is only valid until the next call on this mapper and
    ///   must not alias another live reference to the same memory.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

impl<M: PhysMapper> PhysMapper for &M {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// Map a page-table frame and return a mutable reference to it.
///
/// # Safety
/// - `frame` must hold a page table.
/// - Same lifetime rules as [`PhysMapper::phys_to_mut`].
#[inline]
pub(crate) unsafe fn table_mut<'a, M: PhysMapper>(m: &M, frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(frame.base()) }
}
