//! # Direct-Map PhysMapper
//!
//! Once the kernel has established its higher-half direct map (HHDM), every
//! physical address `pa` is reachable at `base + pa` and page tables no
//! longer need the [`BootstrapMapper`](crate::bootstrap::BootstrapMapper)'s
//! sliding window.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//!
//! // Pretend physical 0x3000 lives in this host buffer.
//! let mut table = Box::new(PageTable::zeroed());
//! let base = (&raw mut *table as u64).wrapping_sub(0x3000);
//! let mapper = HhdmPhysMapper::new(base);
//! unsafe {
//!     let t: &mut PageTable = mapper.phys_to_mut(PhysicalAddress::new(0x3000));
//!     assert!(t.is_empty());
//! }
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a linear map of all physical memory at a fixed offset.
///
/// # Safety
/// The direct map must be present and cover every physical address handed
/// to [`phys_to_mut`](PhysMapper::phys_to_mut).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    base: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    /// Virtual address of physical address zero.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.base.wrapping_add(pa.as_u64()) as usize as *mut T;
        // SAFETY: caller guarantees `pa` is covered by the direct map.
        unsafe { &mut *va }
    }
}
