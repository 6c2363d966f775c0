//! # Page Tables
//!
//! All four levels (Root, L3, L2, L1) share one 64-bit entry layout and one
//! 4 KiB-aligned table of 512 entries. The level only decides how an entry is
//! interpreted:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  Root |   L3  |   L2  |   L1  | Offset |
//! ```
//!
//! - A **non-leaf** entry (`PS=0` at Root/L3/L2) points to the next table.
//! - A **leaf** entry maps memory: always at L1 (4 KiB), and at L2 with `PS=1`
//!   (2 MiB, used only for the bootstrap window).

use bitfield_struct::bitfield;
use kernel_info::memory::KERNEL_ROOT_SLOT;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};

/// A single page-table entry, hardware layout (x86-64, 4-level paging).
#[bitfield(u64)]
pub struct PageTableEntry {
    /// **Present** (bit 0): valid entry if set.
    pub present: bool,

    /// **Writable** (bit 1): write permission, intersected across the walk.
    pub writable: bool,

    /// **User/Supervisor** (bit 2): allow CPL=3 access if set.
    pub user: bool,

    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,

    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,

    /// **Accessed** (bit 5): set by the CPU on first use.
    pub accessed: bool,

    /// **Dirty** (bit 6): set by the CPU on first write through a leaf.
    pub dirty: bool,

    /// **Page Size** (bit 7): leaf at L2/L3. At L1 this bit is PAT.
    pub large_page: bool,

    /// **Global** (bit 8): survives CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// OS-available low (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical base bits 51:12.
    #[bits(40)]
    phys_addr_51_12: u64,

    /// OS-available high (bits 52..62).
    #[bits(11)]
    pub os_available_high: u16,

    /// **No-Execute** (bit 63): forbid instruction fetch when EFER.NXE=1.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Non-present, all bits clear.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }

    /// A non-leaf entry linking to the next-level table at `table`.
    ///
    /// Non-leaf entries are always present and writable so that leaf entries
    /// alone decide the effective permissions. `user` must be set for
    /// anything reachable from user mode.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalPage<Size4K>, user: bool) -> Self {
        let mut e = Self::new().with_present(true).with_writable(true).with_user(user);
        e.set_physical_address(table.base());
        e
    }

    /// A 4 KiB leaf for `frame` with `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf_4k(frame: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(flags.writable)
            .with_user(flags.user)
            .with_no_execute(!flags.executable);
        e.set_physical_address(frame.base());
        e
    }

    /// A writable, non-executable 2 MiB leaf (`PS=1`) for `page`.
    #[inline]
    #[must_use]
    pub const fn leaf_2m(page: PhysicalPage<Size2M>) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_large_page(true)
            .with_no_execute(true);
        e.set_physical_address(page.base());
        e
    }

    /// Set the referenced physical base (must be 4 KiB-aligned).
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_aligned::<Size4K>());
        self.set_phys_addr_51_12(phys.as_u64() >> 12);
    }

    /// The referenced physical base (table, 4 KiB frame or large page).
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_51_12() << 12)
    }

    /// The referenced 4 KiB frame.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(self.physical_address())
    }

    /// If this is a present non-leaf entry, the next table's frame.
    ///
    /// Only meaningful above L1, where `PS=0` means "points to a table".
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() && !self.large_page() {
            Some(self.frame())
        } else {
            None
        }
    }
}

/// Permissions of a leaf mapping.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PageFlags {
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
}

impl PageFlags {
    /// Supervisor read/write data, no execute.
    pub const KERNEL_DATA: Self = Self::new(true, false);

    /// Supervisor read-only code.
    pub const KERNEL_CODE: Self = Self::new(false, true);

    #[must_use]
    pub const fn new(writable: bool, executable: bool) -> Self {
        Self {
            writable,
            executable,
            user: false,
        }
    }

    /// The same permissions, reachable from user mode.
    #[must_use]
    pub const fn user(self) -> Self {
        Self { user: true, ..self }
    }
}

/// Index into any page table (`0..512`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageTableIndex(u16);

impl PageTableIndex {
    /// Number of entries per table.
    pub const COUNT: u16 = 512;

    /// The Root slot shared by every address space.
    #[allow(clippy::cast_possible_truncation)]
    pub const KERNEL_SLOT: Self = Self(KERNEL_ROOT_SLOT as u16);

    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < Self::COUNT);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// Translation level; `Root` is walked first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageTableLevel {
    Root,
    L3,
    L2,
    L1,
}

impl PageTableLevel {
    /// All levels in walk order.
    pub const ALL: [Self; 4] = [Self::Root, Self::L3, Self::L2, Self::L1];

    /// Position of this level's index within a virtual address.
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Root => 39,
            Self::L3 => 30,
            Self::L2 => 21,
            Self::L1 => 12,
        }
    }

    /// Bytes translated by one entry at this level.
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below, or `None` at L1.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Root => Some(Self::L3),
            Self::L3 => Some(Self::L2),
            Self::L2 => Some(Self::L1),
            Self::L1 => None,
        }
    }

    /// The index `va` selects at this level.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> PageTableIndex {
        PageTableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }
}

/// The four table indices a virtual address selects, by level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableIndices {
    pub root: PageTableIndex,
    pub l3: PageTableIndex,
    pub l2: PageTableIndex,
    pub l1: PageTableIndex,
}

impl TableIndices {
    #[inline]
    #[must_use]
    pub const fn of(va: VirtualAddress) -> Self {
        Self {
            root: PageTableLevel::Root.index_of(va),
            l3: PageTableLevel::L3.index_of(va),
            l2: PageTableLevel::L2.index_of(va),
            l1: PageTableLevel::L1.index_of(va),
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, level: PageTableLevel) -> PageTableIndex {
        match level {
            PageTableLevel::Root => self.root,
            PageTableLevel::L3 => self.l3,
            PageTableLevel::L2 => self.l2,
            PageTableLevel::L1 => self.l1,
        }
    }

    /// Whether `va` lies in the shared kernel half.
    #[inline]
    #[must_use]
    pub const fn is_kernel_half(&self) -> bool {
        self.root.as_usize() == KERNEL_ROOT_SLOT
    }
}

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> TableIndices {
    TableIndices::of(va)
}

/// One page table: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::empty(); 512],
        }
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: PageTableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: PageTableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_empty())
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

const _: () = {
    assert!(size_of::<PageTableEntry>() == 8);
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_hardware_layout() {
        let va = VirtualAddress::new(0xFFFF_FF80_4020_1ABC);
        let idx = split_indices(va);
        assert_eq!(idx.root.as_usize(), 511);
        assert_eq!(idx.l3.as_usize(), 1);
        assert_eq!(idx.l2.as_usize(), 1);
        assert_eq!(idx.l1.as_usize(), 1);
        assert!(idx.is_kernel_half());

        let low = split_indices(VirtualAddress::new(0x0000_0000_0040_3000));
        assert_eq!(low.root.as_usize(), 0);
        assert_eq!(low.l2.as_usize(), 2);
        assert_eq!(low.l1.as_usize(), 3);
        assert!(!low.is_kernel_half());
    }

    #[test]
    fn leaf_encoding() {
        let frame = PhysicalPage::<Size4K>::from_frame_number(0x5555);
        let e = PageTableEntry::leaf_4k(frame, PageFlags::KERNEL_DATA);
        assert!(e.present());
        assert!(e.writable());
        assert!(e.no_execute());
        assert!(!e.user());
        assert_eq!(e.frame(), frame);
        assert_eq!(e.into_bits(), 0x8000_0000_0555_5003);

        let code = PageTableEntry::leaf_4k(frame, PageFlags::KERNEL_CODE.user());
        assert!(!code.writable());
        assert!(!code.no_execute());
        assert!(code.user());
    }

    #[test]
    fn table_entries_are_never_leaves() {
        let frame = PhysicalPage::<Size4K>::from_frame_number(7);
        let e = PageTableEntry::table(frame, true);
        assert_eq!(e.next_table(), Some(frame));

        let large = PageTableEntry::leaf_2m(PhysicalPage::<Size2M>::from_frame_number(3));
        assert_eq!(large.next_table(), None);
        assert_eq!(large.physical_address().as_u64(), 0x60_0000);
        assert!(PageTableEntry::empty().next_table().is_none());
    }

    #[test]
    fn zeroed_table_is_empty() {
        let mut t = PageTable::zeroed();
        assert!(t.is_empty());
        t.set(PageTableIndex::new(3), PageTableEntry::new().with_present(true));
        assert_eq!(t.present_count(), 1);
        t.zero();
        assert!(t.is_empty());
    }
}
