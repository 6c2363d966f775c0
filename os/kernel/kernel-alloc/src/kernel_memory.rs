//! # Kernel Memory
//!
//! [`KernelMemory`] ties the memory subsystem together: it owns the physical
//! mapper, the MMU backend, the interrupt lock, the frame allocator and the
//! root of the kernel address space. Every operation masks interrupts for its
//! duration, so handlers and normal code never observe half-updated page
//! tables or allocator state.
//!
//! ## Lifecycle
//!
//! ```text
//!  boot memory map ──► PhysicalFrameAllocator::new
//!                              │
//!  BootstrapMapper ──► KernelMemory::new ──► kernel space (Root + shared L3)
//!                              │
//!                              ├─► create_address_space / destroy_address_space
//!                              ├─► map_page / map_anonymous / unmap_page
//!                              └─► heap_pages ──► KernelHeap
//! ```

use crate::frame_alloc::PhysicalFrameAllocator;
use crate::heap_adapter::KernelHeapAdapter;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::{InterruptControl, InterruptLock, IrqCell};
use kernel_vmem::{
    AddressSpace, CreateError, FreeFrameError, MapError, Mmu, PageFlags, PhysMapper, SpaceKind, UnmapError,
};
use log::{debug, error, info, warn};

/// The kernel's memory subsystem.
pub struct KernelMemory<'s, M: PhysMapper, U: Mmu, C: InterruptControl> {
    mapper: M,
    mmu: U,
    lock: InterruptLock<C>,
    frames: IrqCell<PhysicalFrameAllocator<'s>>,
    kernel_root: PhysicalPage<Size4K>,
}

impl<'s, M: PhysMapper, U: Mmu, C: InterruptControl> KernelMemory<'s, M, U, C> {
    /// Take ownership of the frame allocator and build a fresh kernel space.
    ///
    /// The kernel space is not activated; call
    /// [`switch_to`](Self::switch_to) once its mappings are in place.
    ///
    /// # Errors
    /// [`CreateError::OutOfMemory`] if the two kernel table frames cannot be
    /// allocated.
    pub fn new(mapper: M, mmu: U, control: C, mut frames: PhysicalFrameAllocator<'s>) -> Result<Self, CreateError> {
        let kernel_root = AddressSpace::new_kernel(&mapper, &mut frames)?.root_page();
        info!(
            "kernel memory ready: kernel root {kernel_root}, {} of {} frames free",
            frames.free_count(),
            frames.total_count()
        );

        Ok(Self {
            mapper,
            mmu,
            lock: InterruptLock::new(control),
            frames: IrqCell::new(frames),
            kernel_root,
        })
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    /// The interrupt lock serializing all memory operations.
    #[must_use]
    pub const fn lock(&self) -> &InterruptLock<C> {
        &self.lock
    }

    /// Run `f` on the frame allocator with interrupts masked.
    pub(crate) fn with_frames<R>(&self, f: impl FnOnce(&mut PhysicalFrameAllocator<'s>) -> R) -> R {
        let guard = self.lock.acquire();
        self.frames.with(&guard, f)
    }

    pub fn allocate_frame(&self) -> Option<PhysicalPage<Size4K>> {
        self.with_frames(PhysicalFrameAllocator::allocate)
    }

    /// # Errors
    /// See [`PhysicalFrameAllocator::free`].
    pub fn free_frame(&self, pa: PhysicalAddress) -> Result<(), FreeFrameError> {
        self.with_frames(|frames| frames.free(pa))
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.with_frames(|frames| frames.free_count())
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.with_frames(|frames| frames.total_count())
    }

    /// Handle to the kernel address space.
    #[must_use]
    pub const fn kernel_space(&self) -> AddressSpace<'_, M> {
        // SAFETY: the kernel root was built or adopted at construction and
        // is never destroyed through this type.
        unsafe { AddressSpace::from_root(&self.mapper, self.kernel_root, SpaceKind::Kernel) }
    }

    /// Handle to a process space previously created by
    /// [`create_address_space`](Self::create_address_space).
    ///
    /// # Safety
    /// `root` must be the root of a live process space of this kernel, and
    /// at most one handle to it may be destroyed.
    #[must_use]
    pub const unsafe fn process_space(&self, root: PhysicalPage<Size4K>) -> AddressSpace<'_, M> {
        unsafe { AddressSpace::from_root(&self.mapper, root, SpaceKind::Process) }
    }

    /// Create a process space sharing the kernel half.
    ///
    /// # Errors
    /// [`CreateError::OutOfMemory`] if no frame is left for the root.
    pub fn create_address_space(&self) -> Result<AddressSpace<'_, M>, CreateError> {
        let kernel = self.kernel_space();
        self.with_frames(|frames| AddressSpace::create(&kernel, frames))
    }

    /// Release every frame of a process space.
    ///
    /// If `space` is active, the kernel space is activated first so the CPU
    /// never translates through freed tables. The kernel space itself is
    /// never destroyed.
    pub fn destroy_address_space(&self, space: AddressSpace<'_, M>) {
        if space.root_page() == self.kernel_root {
            error!("refusing to destroy the kernel address space");
            return;
        }

        let guard = self.lock.acquire();
        if space.is_active(&self.mmu) {
            debug!("destroying active space {}, switching to kernel space", space.root_page());
            self.kernel_space().activate(&self.mmu);
        }
        self.frames.with(&guard, |frames| space.destroy(frames));
    }

    /// Map `va` to an existing frame `pa` in `space`.
    ///
    /// # Errors
    /// See [`AddressSpace::map_page`].
    pub fn map_page(
        &self,
        space: &AddressSpace<'_, M>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.with_frames(|frames| space.map_page(frames, va, pa, flags))
    }

    /// Map `va` to a freshly allocated, zeroed frame.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for the page or its
    /// tables, or any error of [`AddressSpace::map_page`]. The frame is
    /// released again on failure.
    pub fn map_anonymous(
        &self,
        space: &AddressSpace<'_, M>,
        va: VirtualAddress,
        flags: PageFlags,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        self.with_frames(|frames| {
            let frame = frames.allocate().ok_or(MapError::OutOfMemory)?;
            // SAFETY: the frame was just handed out and nothing refers to it.
            unsafe { self.mapper.phys_to_mut::<[u8; 4096]>(frame.base()) }.fill(0);

            if let Err(err) = space.map_page(frames, va, frame.base(), flags) {
                if let Err(free) = frames.free(frame.base()) {
                    error!("releasing frame after failed map: {free}");
                }
                return Err(err);
            }
            Ok(frame)
        })
    }

    /// Unmap `va` and return its frame to the allocator.
    ///
    /// Frames the allocator does not manage (device memory, the kernel image)
    /// are unmapped but not freed.
    ///
    /// # Errors
    /// - [`UnmapError::NotMapped`] if `va` is not mapped.
    /// - [`UnmapError::LargePage`] if a large leaf covers `va`.
    pub fn unmap_page(&self, space: &AddressSpace<'_, M>, va: VirtualAddress) -> Result<(), UnmapError> {
        self.with_frames(|frames| {
            let frame = space.unmap_page(va, &self.mmu)?;
            if frames.free(frame.base()).is_err() {
                warn!("unmapped {va} -> {frame} is not an allocator frame, not freed");
            }
            Ok(())
        })
    }

    /// Make `space` the active address space.
    ///
    /// Returns `true` if the root was reloaded.
    pub fn switch_to(&self, space: &AddressSpace<'_, M>) -> bool {
        self.lock.with(|_| space.activate(&self.mmu))
    }

    /// Page source for the kernel heap, backed by the kernel heap window.
    #[must_use]
    pub const fn heap_pages(&self) -> KernelHeapAdapter<'_, 's, M, U, C> {
        KernelHeapAdapter::new(self)
    }
}
