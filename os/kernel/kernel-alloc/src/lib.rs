//! # Kernel Memory Allocation
//!
//! Physical frame management, the early physical-memory window, and the
//! kernel heap, tied together by [`KernelMemory`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  KernelHeap (GlobalAlloc)                            │
//! │    first-fit free list, grows/shrinks by pages       │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ PageSource
//! ┌──────────────────────────▼───────────────────────────┐
//! │  KernelHeapAdapter                                   │
//! │    kernel heap window of the kernel address space    │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────────┐
//! │  KernelMemory                                        │
//! │    AddressSpace (kernel-vmem) · InterruptLock/IrqCell │
//! └───────────────┬──────────────────────────┬───────────┘
//!                 │ FrameAlloc               │ PhysMapper
//! ┌───────────────▼───────────┐  ┌───────────▼───────────┐
//! │  PhysicalFrameAllocator   │  │  BootstrapMapper      │
//! │    array stack + bitmap   │  │  HhdmPhysMapper       │
//! └───────────────────────────┘  └───────────────────────┘
//! ```
//!
//! ## Boot sequence
//!
//! ```rust,ignore
//! static mut FRAMES: StaticFrameStorage<16384> = StaticFrameStorage::new();
//!
//! let frames = PhysicalFrameAllocator::new(unsafe { (*&raw mut FRAMES).storage() }, regions, image_end);
//! let mapper = unsafe { BootstrapMapper::new(window_directory, X86Mmu) };
//! let memory = KernelMemory::new(mapper, X86Mmu, X86Interrupts, frames)?;
//! let heap = KernelHeap::new(memory.heap_pages());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bootstrap;
pub mod frame_alloc;
pub mod heap;
pub mod heap_adapter;
pub mod kernel_memory;
pub mod phys_mapper;

pub use crate::bootstrap::BootstrapMapper;
pub use crate::frame_alloc::{FrameStorage, PhysicalFrameAllocator, StaticFrameStorage};
pub use crate::heap::{HeapStats, KernelHeap};
pub use crate::heap_adapter::{HeapError, KernelHeapAdapter, PageSource};
pub use crate::kernel_memory::KernelMemory;
pub use crate::phys_mapper::HhdmPhysMapper;
