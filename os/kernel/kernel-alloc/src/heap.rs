//! # Kernel Heap
//!
//! A first-fit, address-ordered, coalescing free-list allocator on top of a
//! [`PageSource`]. Free blocks carry their own header:
//!
//! ```text
//! +-------------------+--------------------------------+
//! | FreeBlock header  |   rest of the free block       |
//! +-------------------+--------------------------------+
//! ^ block start       (size counts the whole block, header included)
//! ```
//!
//! Every block starts on and spans a multiple of [`GRANULE`] bytes, so any
//! split leaves remainders big enough for a header.
//!
//! The heap grows by whole pages when no free block fits a request, and
//! returns page-aligned, fully free interiors of blocks to the source as soon
//! as a deallocation produces one.

use crate::heap_adapter::{HeapError, PageSource};
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PageSize, Size4K};
use log::{debug, error};

/// Allocation granule; also the minimum block alignment.
pub const GRANULE: usize = 16;

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = Size4K::SIZE as usize;

/// Pages requested at least per growth step.
const MIN_GROW_PAGES: usize = 4;

const _: () = assert!(size_of::<FreeBlock>() <= GRANULE);

#[repr(C)]
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

#[inline]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + (align - 1)) & !(align - 1)
}

#[inline]
const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Address-ordered singly linked list of free blocks behind a sentinel.
struct FreeList {
    head: FreeBlock,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: FreeBlock {
                size: 0,
                next: ptr::null_mut(),
            },
        }
    }

    /// First-fit: carve `size` bytes aligned to `align` out of the first
    /// block that has room; the remainders stay on the list.
    fn take(&mut self, size: usize, align: usize) -> Option<usize> {
        let mut prev: *mut FreeBlock = &raw mut self.head;

        // SAFETY: every linked node is a free block inside memory we own.
        unsafe {
            loop {
                let block = (*prev).next;
                if block.is_null() {
                    return None;
                }

                let start_addr = block as usize;
                let block_end = start_addr + (*block).size;
                let alloc_start = align_up(start_addr, align);
                let alloc_end = alloc_start.checked_add(size)?;

                if alloc_end <= block_end {
                    let mut after = (*block).next;
                    if alloc_end < block_end {
                        let tail = alloc_end as *mut FreeBlock;
                        tail.write(FreeBlock {
                            size: block_end - alloc_end,
                            next: after,
                        });
                        after = tail;
                    }

                    if alloc_start > start_addr {
                        (*block).size = alloc_start - start_addr;
                        (*block).next = after;
                    } else {
                        (*prev).next = after;
                    }
                    return Some(alloc_start);
                }

                prev = block;
            }
        }
    }

    /// Link `[addr, addr + size)` into the list, merging with adjacent
    /// neighbors. Returns the resulting block.
    ///
    /// # Safety
    /// The range must be unused, writable, [`GRANULE`]-aligned, and not
    /// overlap any free block.
    unsafe fn insert(&mut self, addr: usize, size: usize) -> (usize, usize) {
        let head: *mut FreeBlock = &raw mut self.head;
        let mut prev = head;

        unsafe {
            while !(*prev).next.is_null() && ((*prev).next as usize) < addr {
                prev = (*prev).next;
            }

            let next = (*prev).next;
            debug_assert!(next.is_null() || addr + size <= next as usize, "free block overlaps its successor");
            debug_assert!(prev == head || prev as usize + (*prev).size <= addr, "free block overlaps its predecessor");

            let node = addr as *mut FreeBlock;
            node.write(FreeBlock { size, next });

            if !next.is_null() && addr + size == next as usize {
                (*node).size += (*next).size;
                (*node).next = (*next).next;
            }

            if prev != head && prev as usize + (*prev).size == addr {
                (*prev).size += (*node).size;
                (*prev).next = (*node).next;
                return (prev as usize, (*prev).size);
            }

            (*prev).next = node;
            (addr, (*node).size)
        }
    }

    /// Unlink the block starting at `addr`.
    fn remove(&mut self, addr: usize) -> bool {
        let mut prev: *mut FreeBlock = &raw mut self.head;
        // SAFETY: every linked node is a free block inside memory we own.
        unsafe {
            while !(*prev).next.is_null() {
                let block = (*prev).next;
                if block as usize == addr {
                    (*prev).next = (*block).next;
                    return true;
                }
                prev = block;
            }
        }
        false
    }

    fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut block = self.head.next;
        while !block.is_null() {
            // SAFETY: linked nodes are valid free blocks.
            unsafe {
                total += (*block).size;
                block = (*block).next;
            }
        }
        total
    }
}

struct HeapState {
    list: FreeList,
    pages: usize,
}

/// Point-in-time heap usage.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    /// Pages currently obtained from the page source.
    pub pages: usize,
    /// Bytes on the free list.
    pub free_bytes: usize,
}

/// General-purpose kernel allocator.
///
/// All state changes happen between [`PageSource::lock`] and
/// [`PageSource::unlock`], so a single-core kernel may use it from
/// interrupt handlers and normal code alike.
pub struct KernelHeap<S: PageSource> {
    source: S,
    state: UnsafeCell<HeapState>,
}

// SAFETY: the state is only touched while the source's lock is held.
unsafe impl<S: PageSource + Sync> Sync for KernelHeap<S> {}

impl<S: PageSource> KernelHeap<S> {
    pub const fn new(source: S) -> Self {
        Self {
            source,
            state: UnsafeCell::new(HeapState {
                list: FreeList::new(),
                pages: 0,
            }),
        }
    }

    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Allocate memory for `layout`, growing the heap if needed.
    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let (size, align) = normalize(layout);
        self.locked(|state| {
            if let Some(addr) = state.list.take(size, align) {
                return NonNull::new(addr as *mut u8);
            }

            if let Err(err) = self.grow(state, size, align) {
                debug!("heap cannot grow for {size} bytes: {err}");
                return None;
            }
            state.list.take(size, align).and_then(|addr| NonNull::new(addr as *mut u8))
        })
    }

    /// Return memory obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this heap with the same `layout`,
    /// and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let (size, _) = normalize(layout);
        self.locked(|state| {
            // SAFETY: the caller hands back a live allocation of `size` bytes.
            let (block, block_size) = unsafe { state.list.insert(ptr.as_ptr() as usize, size) };
            self.shrink(state, block, block_size);
        });
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.locked(|state| HeapStats {
            pages: state.pages,
            free_bytes: state.list.free_bytes(),
        })
    }

    fn locked<R>(&self, f: impl FnOnce(&mut HeapState) -> R) -> R {
        let _held = Locked::new(&self.source);
        // SAFETY: exclusive while the source lock is held; nothing called
        // from here re-enters the heap.
        f(unsafe { &mut *self.state.get() })
    }

    fn grow(&self, state: &mut HeapState, size: usize, align: usize) -> Result<(), HeapError> {
        // Fresh pages are page-aligned; larger alignments may need padding.
        let bytes = size.checked_add(align.saturating_sub(PAGE)).ok_or(HeapError::OutOfMemory)?;
        let pages = bytes.div_ceil(PAGE).max(MIN_GROW_PAGES);

        let region = self.source.alloc_pages(pages)?;
        // SAFETY: fresh pages from the source, page-aligned and unused.
        unsafe { state.list.insert(region.as_ptr() as usize, pages * PAGE) };
        state.pages += pages;
        debug!("heap grew by {pages} pages at {region:p}");
        Ok(())
    }

    /// Give the page-aligned interior of the free block back to the source.
    fn shrink(&self, state: &mut HeapState, block: usize, block_size: usize) {
        let block_end = block + block_size;
        let lo = align_up(block, PAGE);
        let hi = align_down(block_end, PAGE);
        if hi <= lo {
            return;
        }

        let removed = state.list.remove(block);
        debug_assert!(removed);
        // SAFETY: both remainders were part of the removed free block.
        unsafe {
            if lo > block {
                state.list.insert(block, lo - block);
            }
            if block_end > hi {
                state.list.insert(hi, block_end - hi);
            }
        }

        let pages = (hi - lo) / PAGE;
        let Some(start) = NonNull::new(lo as *mut u8) else {
            return;
        };
        // SAFETY: the interior is off the free list and holds no allocation.
        if let Err(err) = unsafe { self.source.free_pages(start, pages) } {
            error!("heap could not release {pages} pages at {start:p}: {err}");
        }
        state.pages -= pages;
        debug!("heap shrank by {pages} pages at {start:p}");
    }
}

unsafe impl<S: PageSource> GlobalAlloc for KernelHeap<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.deallocate(ptr, layout) }
        }
    }
}

/// Block size and alignment for `layout`, both multiples of [`GRANULE`].
fn normalize(layout: Layout) -> (usize, usize) {
    let size = align_up(layout.size().max(1), GRANULE);
    (size, layout.align().max(GRANULE))
}

/// Holds the page source's lock for its lifetime.
struct Locked<'a, S: PageSource>(&'a S);

impl<'a, S: PageSource> Locked<'a, S> {
    fn new(source: &'a S) -> Self {
        source.lock();
        Self(source)
    }
}

impl<S: PageSource> Drop for Locked<'_, S> {
    fn drop(&mut self) {
        // SAFETY: paired with the `lock` in `new`.
        unsafe { self.0.unlock() }
    }
}
