//! # Translation Hardware
//!
//! [`Mmu`] is the seam between the page-table code and the CPU: reading and
//! loading the translation root and keeping the TLB coherent after entries
//! change. [`X86Mmu`] drives CR3 and `invlpg`.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Translation root register and TLB maintenance.
pub trait Mmu {
    /// Root table of the currently active address space.
    fn current_root(&self) -> PhysicalPage<Size4K>;

    /// Switch translation to the tree rooted at `root`.
    ///
    /// # Safety
    /// `root` must be a valid top-level table that maps the executing code,
    /// the current stack, and every kernel structure in use.
    unsafe fn load_root(&self, root: PhysicalPage<Size4K>);

    /// Drop any cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drop all cached non-global translations.
    fn flush_all(&self);

    /// Pointer through which memory at `target` is reached once `va`
    /// translates to it. On real hardware that is `va` itself.
    fn resolve(&self, va: VirtualAddress, target: PhysicalAddress) -> *mut u8 {
        let _ = target;
        va.as_mut_ptr()
    }
}

impl<U: Mmu + ?Sized> Mmu for &U {
    fn current_root(&self) -> PhysicalPage<Size4K> {
        (**self).current_root()
    }

    unsafe fn load_root(&self, root: PhysicalPage<Size4K>) {
        unsafe { (**self).load_root(root) }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }

    fn flush_all(&self) {
        (**self).flush_all();
    }

    fn resolve(&self, va: VirtualAddress, target: PhysicalAddress) -> *mut u8 {
        (**self).resolve(va, target)
    }
}

/// CR3: root table base register (IA-32e, PCID disabled).
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: reserved.
    #[bits(3)]
    __reserved0: u8,

    /// Bit 3: PWT for root-table accesses.
    pub pwt: bool,

    /// Bit 4: PCD for root-table accesses.
    pub pcd: bool,

    /// Bits 5–11: reserved.
    #[bits(7)]
    __reserved1: u8,

    /// Bits 12–51: root table physical base >> 12.
    #[bits(40)]
    root_base_4k: u64,

    /// Bits 52–63: reserved.
    #[bits(12)]
    __reserved2: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` with write-back caching.
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_base_4k(root.frame_number())
    }

    /// The root table frame.
    #[must_use]
    pub const fn root(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.root_base_4k())
    }
}

/// The executing x86-64 core's MMU.
///
/// # Safety & Privilege
///
/// Accesses CR3 and executes `invlpg`; ring 0 only.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

#[cfg(target_arch = "x86_64")]
impl X86Mmu {
    fn read_cr3() -> Cr3 {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Cr3::from_bits(cr3)
    }

    unsafe fn write_cr3(value: Cr3) {
        let cr3 = value.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Mmu for X86Mmu {
    fn current_root(&self) -> PhysicalPage<Size4K> {
        Self::read_cr3().root()
    }

    unsafe fn load_root(&self, root: PhysicalPage<Size4K>) {
        unsafe { Self::write_cr3(Cr3::from_root(root)) }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn flush_all(&self) {
        // Writing CR3 back unchanged drops every non-global TLB entry.
        unsafe { Self::write_cr3(Self::read_cr3()) }
    }
}
