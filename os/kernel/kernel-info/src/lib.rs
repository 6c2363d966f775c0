//! # Kernel Memory Layout and Boot Memory Map
//!
//! Shared constants and boot-contract types for the memory subsystem.
//!
//! ## Modules
//!
//! ### Boot Information ([`boot`])
//! The platform hands the kernel a list of physical memory regions
//! (`{base, length, kind}`) together with the physical address past the end
//! of the loaded kernel image. Only [`MemoryRegionKind::Available`] memory
//! above the image end may ever reach the frame allocator.
//!
//! ### Memory Layout ([`memory`])
//! The virtual layout every address space shares:
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐ Root slots 0..=255
//!                       │   Private (per address space)   │
//! 0x0000_7FFF_FFFF_FFFF ├─────────────────────────────────┤
//!                       │   non-canonical hole            │
//! 0xFFFF_8000_0000_0000 ├─────────────────────────────────┤ Root slots 256..=510
//!                       │   Private (per address space)   │
//! KERNEL_HALF_BASE      ├─────────────────────────────────┤ Root slot 511 (shared)
//!                       │   HHDM (physical memory window) │
//! KERNEL_HEAP_START     ├─────────────────────────────────┤
//!                       │   Kernel heap                   │
//! KERNEL_BASE           ├─────────────────────────────────┤
//!                       │   Kernel image                  │
//! BOOTSTRAP_WINDOW      ├─────────────────────────────────┤
//!                       │   2 MiB bootstrap window        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
