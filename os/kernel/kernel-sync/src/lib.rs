//! # Kernel synchronization primitives
//!
//! The memory subsystem runs on a single core, so mutual exclusion is
//! achieved by masking interrupts rather than by spinning:
//!
//! - [`InterruptLock`] is a reference-counted interrupt mask. The outermost
//!   acquire records whether interrupts were enabled and masks them; nested
//!   acquires only count; the outermost release restores the recorded state.
//! - [`IrqCell`] holds data that may only be touched while such a lock is
//!   held, proven by passing an [`IrqGuard`].
//! - [`InterruptControl`] is the hardware seam; [`X86Interrupts`] drives
//!   `RFLAGS.IF` with `cli`/`sti`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod irq_cell;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(target_arch = "x86_64")]
pub use irq::X86Interrupts;
pub use irq::{InterruptControl, InterruptLock, IrqGuard};
pub use irq_cell::IrqCell;

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// Must pair with a preceding successful [`RawLock::raw_lock`] or
    /// [`RawLock::raw_try_lock`] on the same lock.
    unsafe fn raw_unlock(&self);
}
