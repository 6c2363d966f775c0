//! # Heap Page Source
//!
//! The kernel heap asks for memory in whole pages. [`KernelHeapAdapter`]
//! serves those requests from the kernel heap window
//! (`KERNEL_HEAP_START..KERNEL_HEAP_END`) of the kernel address space:
//! find a free virtual run, back every page with a fresh frame, map it.
//! The heap window lies in the shared kernel half, so heap memory is visible
//! from every address space.

use crate::kernel_memory::KernelMemory;
use core::ptr::NonNull;
use kernel_info::memory::{KERNEL_HEAP_END, KERNEL_HEAP_START};
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_sync::{InterruptControl, RawLock, RawUnlock};
use kernel_vmem::{AddressSpace, MapError, Mmu, PageFlags, PhysMapper, UnmapError};
use log::{debug, error, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("zero pages requested")]
    ZeroPages,
    #[error("no free virtual range in the heap window")]
    NoVirtualRange,
    #[error("out of physical frames")]
    OutOfMemory,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Unmap(#[from] UnmapError),
}

/// Supplier of page-granular, page-aligned memory for a heap.
pub trait PageSource {
    /// Enter the critical section guarding heap state. Nests.
    fn lock(&self);

    /// Leave the critical section entered by [`lock`](Self::lock).
    ///
    /// # Safety
    /// Must pair with a preceding `lock` on the same source.
    unsafe fn unlock(&self);

    /// Allocate `pages` contiguous, writable pages.
    ///
    /// # Errors
    /// [`HeapError`] if the request cannot be satisfied; nothing stays
    /// allocated in that case.
    fn alloc_pages(&self, pages: usize) -> Result<NonNull<u8>, HeapError>;

    /// Return `pages` pages starting at `ptr`.
    ///
    /// Any page-aligned sub-range of memory obtained from
    /// [`alloc_pages`](Self::alloc_pages) may be returned, in any split.
    ///
    /// # Safety
    /// The pages must be unused and not returned before.
    ///
    /// # Errors
    /// [`HeapError::Unmap`] if a page was not mapped; the remaining pages
    /// are still released.
    unsafe fn free_pages(&self, ptr: NonNull<u8>, pages: usize) -> Result<(), HeapError>;
}

/// [`PageSource`] carving pages out of the kernel heap window.
pub struct KernelHeapAdapter<'k, 's, M: PhysMapper, U: Mmu, C: InterruptControl> {
    memory: &'k KernelMemory<'s, M, U, C>,
}

impl<'k, 's, M: PhysMapper, U: Mmu, C: InterruptControl> KernelHeapAdapter<'k, 's, M, U, C> {
    #[must_use]
    pub const fn new(memory: &'k KernelMemory<'s, M, U, C>) -> Self {
        Self { memory }
    }

    /// Unmap `pages` pages from `start` and free their frames.
    fn release(&self, kernel: &AddressSpace<'_, M>, start: VirtualAddress, pages: usize) -> Result<(), HeapError> {
        let mut result = Ok(());
        for i in 0..pages as u64 {
            let va = start + i * Size4K::SIZE;
            if let Err(err) = self.memory.unmap_page(kernel, va) {
                error!("heap page {va} was not mapped");
                result = result.and(Err(err.into()));
            }
        }
        result
    }
}

impl<M: PhysMapper, U: Mmu, C: InterruptControl> PageSource for KernelHeapAdapter<'_, '_, M, U, C> {
    fn lock(&self) {
        self.memory.lock().raw_lock();
    }

    unsafe fn unlock(&self) {
        unsafe { self.memory.lock().raw_unlock() }
    }

    fn alloc_pages(&self, pages: usize) -> Result<NonNull<u8>, HeapError> {
        if pages == 0 {
            return Err(HeapError::ZeroPages);
        }

        let _guard = self.memory.lock().acquire();
        let kernel = self.memory.kernel_space();
        let start = kernel
            .find_free_range_in(
                pages,
                VirtualAddress::new(KERNEL_HEAP_START),
                VirtualAddress::new(KERNEL_HEAP_END),
            )
            .ok_or(HeapError::NoVirtualRange)?;

        for i in 0..pages {
            let va = start + i as u64 * Size4K::SIZE;
            if let Err(err) = self.memory.map_anonymous(&kernel, va, PageFlags::KERNEL_DATA) {
                warn!("heap growth by {pages} pages failed at page {i}: {err}");
                if let Err(rollback) = self.release(&kernel, start, i) {
                    error!("heap growth rollback at {start} failed: {rollback}");
                }
                return Err(match err {
                    MapError::OutOfMemory => HeapError::OutOfMemory,
                    other => other.into(),
                });
            }
        }

        debug!("heap window: {pages} pages mapped at {start}");
        NonNull::new(start.as_mut_ptr::<u8>()).ok_or(HeapError::NoVirtualRange)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, pages: usize) -> Result<(), HeapError> {
        let _guard = self.memory.lock().acquire();
        let start = VirtualAddress::from_ptr(ptr.as_ptr());
        debug_assert!(start.is_aligned::<Size4K>());

        let kernel = self.memory.kernel_space();
        let result = self.release(&kernel, start, pages);
        debug!("heap window: {pages} pages released at {start}");
        result
    }
}
