//! # Physical Frame Allocator
//!
//! A LIFO stack of free 4 KiB frames, filled once from the boot memory map.
//!
//! Free frames are tracked as frame numbers in an explicit array, never by
//! writing into the frames themselves, so a freed frame's stale contents can
//! never be mistaken for allocator state. A bitmap indexed by frame number
//! records which frames are currently handed out; it catches double frees
//! and frees of frames this allocator never owned.
//!
//! Both arrays live in caller-provided [`FrameStorage`], typically a
//! [`StaticFrameStorage`] placed in `.bss`, so the allocator needs no heap.

use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, FreeFrameError};
use log::{debug, info, warn};

/// Frame numbers covered by one bitmap word.
const FRAMES_PER_WORD: usize = u64::BITS as usize;

/// Backing arrays for a [`PhysicalFrameAllocator`].
///
/// The bitmap covers frame numbers `0..bitmap.len() * 64`; frames above that
/// cannot be managed. The stack bounds how many frames can be free at once.
pub struct FrameStorage<'s> {
    stack: &'s mut [u32],
    bitmap: &'s mut [u64],
}

impl<'s> FrameStorage<'s> {
    pub const fn new(stack: &'s mut [u32], bitmap: &'s mut [u64]) -> Self {
        Self { stack, bitmap }
    }
}

/// Statically sized storage managing physical memory up to
/// `WORDS * 64 * 4 KiB` (e.g. `WORDS = 16384` covers 4 GiB).
pub struct StaticFrameStorage<const WORDS: usize> {
    stack: [[u32; FRAMES_PER_WORD]; WORDS],
    bitmap: [u64; WORDS],
}

impl<const WORDS: usize> StaticFrameStorage<WORDS> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stack: [[0; FRAMES_PER_WORD]; WORDS],
            bitmap: [0; WORDS],
        }
    }

    /// Borrow as [`FrameStorage`].
    pub fn storage(&mut self) -> FrameStorage<'_> {
        FrameStorage::new(self.stack.as_flattened_mut(), &mut self.bitmap)
    }
}

impl<const WORDS: usize> Default for StaticFrameStorage<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical frame allocator over the usable part of the boot memory map.
pub struct PhysicalFrameAllocator<'s> {
    /// `stack[..free]` holds the free frame numbers; the top is the next one handed out.
    stack: &'s mut [u32],
    free: usize,
    total: usize,
    /// Bit set: frame currently allocated.
    allocated: &'s mut [u64],
}

impl<'s> PhysicalFrameAllocator<'s> {
    /// Collect every frame of every available region at or above
    /// `kernel_image_end`.
    ///
    /// Region bounds are clipped to whole frames. A frame listed by several
    /// overlapping regions is added once. Frames the storage cannot represent
    /// are skipped with a warning.
    pub fn new(storage: FrameStorage<'s>, regions: &[MemoryRegion], kernel_image_end: PhysicalAddress) -> Self {
        let FrameStorage { stack, bitmap } = storage;
        bitmap.fill(0);

        let mut this = Self {
            stack,
            free: 0,
            total: 0,
            allocated: bitmap,
        };

        // Frame numbers must also fit the u32 stack slots.
        let coverage = (this.allocated.len() as u64 * FRAMES_PER_WORD as u64).min(1 << u32::BITS);
        let mut skipped = 0_u64;

        for region in regions {
            let Some((start, end)) = region.usable_range(kernel_image_end) else {
                continue;
            };

            let first = start.as_u64() >> Size4K::SHIFT;
            let last = end.as_u64() >> Size4K::SHIFT;
            let covered = last.min(coverage);
            skipped += last - first.max(covered);

            for number in first..covered {
                // During setup the bitmap marks frames already on the stack.
                if this.test_bit(number) {
                    continue;
                }
                if this.free == this.stack.len() {
                    skipped += 1;
                    continue;
                }
                this.set_bit(number, true);
                this.stack[this.free] = u32::try_from(number).unwrap_or(u32::MAX);
                this.free += 1;
            }
        }

        // From here on the bitmap tracks handed-out frames; none are yet.
        this.allocated.fill(0);
        this.total = this.free;
        // Hand out low frames first.
        this.stack[..this.free].reverse();

        if skipped > 0 {
            warn!("frame allocator: {skipped} usable frames exceed storage capacity and are ignored");
        }
        info!(
            "frame allocator: {} frames ({} KiB) available above {kernel_image_end}",
            this.total,
            this.total * 4
        );
        this
    }

    /// Pop a free frame, or `None` when exhausted. O(1).
    pub fn allocate(&mut self) -> Option<PhysicalPage<Size4K>> {
        let Some(top) = self.free.checked_sub(1) else {
            warn!("frame allocator exhausted");
            return None;
        };

        let number = u64::from(self.stack[top]);
        self.free = top;
        self.set_bit(number, true);
        Some(PhysicalPage::from_frame_number(number))
    }

    /// Push a frame back. O(1).
    ///
    /// # Errors
    /// - [`FreeFrameError::Unaligned`] if `pa` is not a frame base.
    /// - [`FreeFrameError::NotAllocated`] if the frame is not currently handed
    ///   out: a double free, or a frame this allocator never managed.
    ///
    /// The free list is left untouched on error.
    pub fn free(&mut self, pa: PhysicalAddress) -> Result<(), FreeFrameError> {
        if !pa.is_aligned::<Size4K>() {
            return Err(FreeFrameError::Unaligned(pa));
        }

        let frame = pa.page::<Size4K>();
        let number = frame.frame_number();
        if !self.test_bit(number) {
            return Err(FreeFrameError::NotAllocated(frame));
        }

        // Every allocated frame came from the stack, so there is room for it.
        debug_assert!(self.free < self.stack.len());
        self.set_bit(number, false);
        self.stack[self.free] = u32::try_from(number).unwrap_or(u32::MAX);
        self.free += 1;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free
    }

    /// Frames managed in total, free or allocated.
    #[inline]
    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.total
    }

    /// Whether `frame` is currently handed out by this allocator.
    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.test_bit(frame.frame_number())
    }

    fn test_bit(&self, number: u64) -> bool {
        let Ok(number) = usize::try_from(number) else {
            return false;
        };
        self.allocated
            .get(number / FRAMES_PER_WORD)
            .is_some_and(|w| w & (1 << (number % FRAMES_PER_WORD)) != 0)
    }

    fn set_bit(&mut self, number: u64, value: bool) {
        let Ok(number) = usize::try_from(number) else {
            return;
        };
        let Some(word) = self.allocated.get_mut(number / FRAMES_PER_WORD) else {
            debug!("frame {number} outside allocator bitmap");
            return;
        };
        let mask = 1 << (number % FRAMES_PER_WORD);
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }
}

impl FrameAlloc for PhysicalFrameAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), FreeFrameError> {
        self.free(frame.base())
    }
}
