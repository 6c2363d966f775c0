//! # Simulated Paging Hardware
//!
//! Host-side stand-ins for physical memory, the MMU, and a frame pool.
//! Physical addresses are byte offsets into one contiguous buffer, so any
//! range of frames (including a whole 2 MiB region) is addressable at once.

use crate::{FrameAlloc, FreeFrameError, Mmu, PhysMapper};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, UnsafeCell};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// A 4 KiB-aligned raw frame.
#[repr(C, align(4096))]
struct Frame([u8; 4096]);

/// Zero-initialized "physical RAM" starting at physical address 0.
pub struct SimulatedRam {
    frames: Vec<UnsafeCell<Frame>>,
}

impl SimulatedRam {
    /// RAM with `frames` 4 KiB frames.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames).map(|_| UnsafeCell::new(Frame([0; 4096]))).collect(),
        }
    }

    /// Size in bytes; the first invalid physical address.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.frames.len() as u64 * 4096
    }

    /// Host pointer to the byte at `pa`.
    ///
    /// # Panics
    /// If `pa` lies outside the simulated RAM.
    #[must_use]
    pub fn ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(pa.as_u64() < self.size(), "physical address {pa} outside simulated RAM");
        let base = UnsafeCell::raw_get(self.frames.as_ptr()).cast::<u8>();
        // SAFETY: in bounds of the frame buffer checked above.
        unsafe { base.add(usize::try_from(pa.as_u64()).unwrap_or(usize::MAX)) }
    }

    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        unsafe { self.ptr(pa).cast::<u64>().read_unaligned() }
    }

    pub fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        unsafe { self.ptr(pa).cast::<u64>().write_unaligned(value) }
    }

    /// Overwrite a whole frame with `byte`.
    pub fn fill_frame(&self, frame: PhysicalPage<Size4K>, byte: u8) {
        unsafe { self.ptr(frame.base()).write_bytes(byte, 4096) }
    }
}

impl PhysMapper for SimulatedRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: the caller promises `T` matches the bytes at `pa`.
        unsafe { &mut *self.ptr(pa).cast::<T>() }
    }
}

/// MMU whose translation root is a plain value and whose TLB operations are
/// recorded for inspection.
///
/// [`Mmu::resolve`] points straight into the simulated RAM, standing in for
/// a real hardware translation of a freshly installed mapping.
pub struct SimulatedMmu<'r> {
    ram: &'r SimulatedRam,
    root: Cell<PhysicalPage<Size4K>>,
    loads: Cell<usize>,
    flushes: Cell<usize>,
    invalidations: RefCell<Vec<VirtualAddress>>,
}

impl<'r> SimulatedMmu<'r> {
    #[must_use]
    pub const fn new(ram: &'r SimulatedRam, root: PhysicalPage<Size4K>) -> Self {
        Self {
            ram,
            root: Cell::new(root),
            loads: Cell::new(0),
            flushes: Cell::new(0),
            invalidations: RefCell::new(Vec::new()),
        }
    }

    /// Number of root loads since creation.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.get()
    }

    /// Number of full TLB flushes since creation.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flushes.get()
    }

    /// Every address passed to `invalidate_page`, in order.
    #[must_use]
    pub fn invalidations(&self) -> Vec<VirtualAddress> {
        self.invalidations.borrow().clone()
    }
}

impl Mmu for SimulatedMmu<'_> {
    fn current_root(&self) -> PhysicalPage<Size4K> {
        self.root.get()
    }

    unsafe fn load_root(&self, root: PhysicalPage<Size4K>) {
        self.root.set(root);
        self.loads.set(self.loads.get() + 1);
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.borrow_mut().push(va);
    }

    fn flush_all(&self) {
        self.flushes.set(self.flushes.get() + 1);
    }

    fn resolve(&self, _va: VirtualAddress, target: PhysicalAddress) -> *mut u8 {
        self.ram.ptr(target)
    }
}

/// Frame pool over a contiguous range of frame numbers, with an optional
/// allocation budget for exhaustion tests.
pub struct VecFrameAlloc {
    free: Vec<PhysicalPage<Size4K>>,
    allocated: BTreeSet<PhysicalPage<Size4K>>,
    budget: Option<usize>,
}

impl VecFrameAlloc {
    /// Pool of `count` frames starting at frame number `first`.
    #[must_use]
    pub fn new(first: u64, count: usize) -> Self {
        let free = (first..first + count as u64)
            .rev()
            .map(PhysicalPage::from_frame_number)
            .collect();
        Self {
            free,
            allocated: BTreeSet::new(),
            budget: None,
        }
    }

    /// Allow only `budget` more successful allocations (`None`: unlimited).
    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl FrameAlloc for VecFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if let Some(budget) = self.budget.as_mut() {
            *budget = budget.checked_sub(1)?;
        }
        let frame = self.free.pop()?;
        self.allocated.insert(frame);
        Some(frame)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), FreeFrameError> {
        if !self.allocated.remove(&frame) {
            return Err(FreeFrameError::NotAllocated(frame));
        }
        self.free.push(frame);
        Ok(())
    }
}
