//! # Boot Memory Map
//!
//! The loader passes the kernel a list of [`MemoryRegion`]s describing
//! physical memory, plus the physical address just past the kernel image.

use kernel_memory_addresses::{PhysicalAddress, Size4K};

/// Classification of a physical memory region as reported by firmware.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// General-purpose RAM, free for the kernel to use.
    Available = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    Defective = 5,
}

/// One entry of the boot memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: PhysicalAddress, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn available(base: u64, length: u64) -> Self {
        Self::new(PhysicalAddress::new(base), length, MemoryRegionKind::Available)
    }

    /// Exclusive end address, saturating at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64().saturating_add(self.length))
    }

    /// The frame-aligned usable part of this region at or above `floor`.
    ///
    /// Returns `[start, end)` with `start` rounded up and `end` rounded down to
    /// 4 KiB, or `None` if the region is not [`MemoryRegionKind::Available`]
    /// or no whole frame remains.
    #[must_use]
    pub fn usable_range(&self, floor: PhysicalAddress) -> Option<(PhysicalAddress, PhysicalAddress)> {
        if self.kind != MemoryRegionKind::Available {
            return None;
        }

        let start = self.base.max(floor).checked_align_up::<Size4K>()?;
        let end = self.end().align_down::<Size4K>();
        (start < end).then_some((start, end))
    }
}
