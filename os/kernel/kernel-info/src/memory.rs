//! # Memory Layout

/// Number of entries in every page-table level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Root-table slot shared by every address space (kernel half).
pub const KERNEL_ROOT_SLOT: usize = ENTRIES_PER_TABLE - 1;

/// First virtual address translated through [`KERNEL_ROOT_SLOT`].
pub const KERNEL_HALF_BASE: u64 = 0xffff_ff80_0000_0000;

/// Lowest address handed out by free-range searches in the private half.
///
/// Page zero stays unmapped so null dereferences fault.
pub const USER_SPACE_START: u64 = 0x0000_0000_0000_1000;

/// Exclusive end of the lower canonical half.
pub const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Start of the upper canonical half.
pub const UPPER_HALF_START: u64 = 0xffff_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = KERNEL_HALF_BASE;

/// Size of the HHDM window (256 GiB).
pub const HHDM_SIZE: u64 = 0x0000_0040_0000_0000;

/// Kernel heap window; grown and shrunk page by page.
pub const KERNEL_HEAP_START: u64 = HHDM_BASE + HHDM_SIZE;

/// Exclusive end of the kernel heap window.
pub const KERNEL_HEAP_END: u64 = KERNEL_BASE;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// 2 MiB virtual window used by the bootstrap mapper.
///
/// Lies in the last entry of the page directory that also maps the kernel
/// image, so the boot page tables already provide the table holding it.
pub const BOOTSTRAP_WINDOW: u64 = 0xffff_ffff_bfe0_0000;

const _: () = {
    assert!((KERNEL_HALF_BASE >> 39) & 0x1ff == KERNEL_ROOT_SLOT as u64);
    assert!(KERNEL_HEAP_START < KERNEL_HEAP_END);
    assert!(KERNEL_HEAP_START.is_multiple_of(4096));
    assert!(BOOTSTRAP_WINDOW.is_multiple_of(2 * 1024 * 1024));
    assert!(BOOTSTRAP_WINDOW > KERNEL_BASE);
    // Window and kernel image share one page directory (1 GiB span).
    assert!(BOOTSTRAP_WINDOW >> 30 == KERNEL_BASE >> 30);
    assert!(USER_SPACE_START < LOWER_HALF_END);
};
