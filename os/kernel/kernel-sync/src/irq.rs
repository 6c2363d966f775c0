use crate::{RawLock, RawUnlock};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Hardware interrupt-flag control.
///
/// Implementations must be usable from any kernel context; they are called
/// with the lock state already updated, never while it is inconsistent.
pub trait InterruptControl {
    /// Whether maskable interrupts are currently delivered.
    fn interrupts_enabled(&self) -> bool;

    /// Mask interrupts (`cli` on x86).
    fn disable(&self);

    /// Unmask interrupts (`sti` on x86).
    fn enable(&self);
}

impl<C: InterruptControl + ?Sized> InterruptControl for &C {
    fn interrupts_enabled(&self) -> bool {
        (**self).interrupts_enabled()
    }

    fn disable(&self) {
        (**self).disable();
    }

    fn enable(&self) {
        (**self).enable();
    }
}

/// `RFLAGS.IF`
#[cfg(target_arch = "x86_64")]
const RFLAGS_IF: u64 = 1 << 9;

/// Interrupt control for the executing x86-64 core.
///
/// # Safety & Privilege
///
/// `cli`/`sti` are privileged; only use this from ring 0.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Interrupts;

#[cfg(target_arch = "x86_64")]
impl X86Interrupts {
    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }
}

#[cfg(target_arch = "x86_64")]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        Self::rflags() & RFLAGS_IF != 0
    }

    #[inline]
    fn disable(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    fn enable(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

/// Reference-counted interrupt mask for a single core.
///
/// The outermost [`acquire`](Self::acquire) snapshots the interrupt-enable
/// state and masks interrupts. Nested acquires only bump the depth. The
/// release that brings the depth back to zero unmasks interrupts **only** if
/// they were enabled at the outermost acquire.
///
/// Between [`enter_handler`](Self::enter_handler) and
/// [`leave_handler`](Self::leave_handler) acquire and release are no-ops:
/// the hardware already masks interrupts on handler entry and the handler's
/// `iret` restores them.
///
/// # Examples
///
/// ```
/// use core::cell::Cell;
/// use kernel_sync::{InterruptControl, InterruptLock};
///
/// struct Flag(Cell<bool>);
///
/// impl InterruptControl for Flag {
///     fn interrupts_enabled(&self) -> bool { self.0.get() }
///     fn disable(&self) { self.0.set(false) }
///     fn enable(&self) { self.0.set(true) }
/// }
///
/// let lock = InterruptLock::new(Flag(Cell::new(true)));
/// {
///     let _outer = lock.acquire();
///     let _inner = lock.acquire();
///     assert!(!lock.control().interrupts_enabled());
///     assert_eq!(lock.depth(), 2);
/// }
/// assert!(lock.control().interrupts_enabled());
/// ```
pub struct InterruptLock<C: InterruptControl> {
    control: C,
    depth: AtomicUsize,
    were_enabled: AtomicBool,
    handler_depth: AtomicUsize,
}

impl<C: InterruptControl> InterruptLock<C> {
    pub const fn new(control: C) -> Self {
        Self {
            control,
            depth: AtomicUsize::new(0),
            were_enabled: AtomicBool::new(false),
            handler_depth: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn control(&self) -> &C {
        &self.control
    }

    /// Number of currently outstanding acquires outside of handlers.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.depth() > 0
    }

    /// Whether execution is currently inside an interrupt handler.
    #[inline]
    #[must_use]
    pub fn in_handler(&self) -> bool {
        self.handler_depth.load(Ordering::Relaxed) > 0
    }

    /// Masks interrupts for the lifetime of the returned guard.
    #[inline]
    #[must_use]
    pub fn acquire(&self) -> IrqGuard<'_, C> {
        self.raw_lock();
        IrqGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Runs `f` with interrupts masked.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&IrqGuard<'_, C>) -> R) -> R {
        let guard = self.acquire();
        f(&guard)
    }

    /// Marks entry into an interrupt handler.
    pub fn enter_handler(&self) {
        self.handler_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks exit from an interrupt handler.
    pub fn leave_handler(&self) {
        let prev = self.handler_depth.load(Ordering::Relaxed);
        if prev == 0 {
            log::error!("leave_handler without matching enter_handler");
            debug_assert!(prev > 0, "unbalanced interrupt handler bracket");
            return;
        }
        self.handler_depth.store(prev - 1, Ordering::Relaxed);
    }

    fn enter(&self) {
        if self.in_handler() {
            return;
        }

        if self.depth.load(Ordering::Relaxed) == 0 {
            let enabled = self.control.interrupts_enabled();
            self.control.disable();
            self.were_enabled.store(enabled, Ordering::Relaxed);
        }
        self.depth.fetch_add(1, Ordering::Acquire);
    }

    fn exit(&self) {
        if self.in_handler() {
            return;
        }

        let depth = self.depth.load(Ordering::Relaxed);
        if depth == 0 {
            log::error!("interrupt lock released while not held");
            debug_assert!(depth > 0, "unbalanced interrupt lock release");
            return;
        }

        self.depth.store(depth - 1, Ordering::Release);
        if depth == 1 && self.were_enabled.load(Ordering::Relaxed) {
            self.control.enable();
        }
    }
}

impl<C: InterruptControl> RawLock for InterruptLock<C> {
    fn raw_lock(&self) {
        self.enter();
    }

    /// Masking interrupts cannot be contended on a single core.
    fn raw_try_lock(&self) -> bool {
        self.enter();
        true
    }
}

impl<C: InterruptControl> RawUnlock for InterruptLock<C> {
    unsafe fn raw_unlock(&self) {
        self.exit();
    }
}

/// RAII token proving interrupts are masked through an [`InterruptLock`].
///
/// Not `Send`: the guard belongs to the context that acquired it.
pub struct IrqGuard<'a, C: InterruptControl> {
    lock: &'a InterruptLock<C>,
    _not_send: PhantomData<*mut ()>,
}

impl<C: InterruptControl> IrqGuard<'_, C> {
    #[inline]
    #[must_use]
    pub const fn lock(&self) -> &InterruptLock<C> {
        self.lock
    }
}

impl<C: InterruptControl> Drop for IrqGuard<'_, C> {
    fn drop(&mut self) {
        unsafe { self.lock.raw_unlock() }
    }
}
