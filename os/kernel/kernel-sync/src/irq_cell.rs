use crate::irq::{InterruptControl, IrqGuard};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Data that is only touched with interrupts masked.
///
/// Access requires an [`IrqGuard`], so no interrupt handler can observe the
/// value half-updated. A nested [`with`](Self::with) on the same cell is a
/// kernel bug and panics instead of handing out a second `&mut`.
pub struct IrqCell<T> {
    borrowed: AtomicBool,
    value: UnsafeCell<T>,
}

// Single core: the guard serializes every access.
unsafe impl<T: Send> Sync for IrqCell<T> {}
unsafe impl<T: Send> Send for IrqCell<T> {}

impl<T> IrqCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Runs `f` with exclusive access to the value.
    ///
    /// # Panics
    /// If the cell is already borrowed by an enclosing `with`.
    pub fn with<C: InterruptControl, R>(&self, guard: &IrqGuard<'_, C>, f: impl FnOnce(&mut T) -> R) -> R {
        match self.try_with(guard, f) {
            Some(r) => r,
            None => panic!("IrqCell accessed re-entrantly"),
        }
    }

    /// Like [`with`](Self::with) but returns `None` instead of panicking.
    pub fn try_with<C: InterruptControl, R>(
        &self,
        _guard: &IrqGuard<'_, C>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        if self.borrowed.swap(true, Ordering::Acquire) {
            return None;
        }

        let _release = BorrowRelease(&self.borrowed);
        Some(f(unsafe { &mut *self.value.get() }))
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

struct BorrowRelease<'a>(&'a AtomicBool);

impl Drop for BorrowRelease<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InterruptLock;
    use crate::testing::SimulatedInterrupts;

    #[test]
    fn with_grants_mutable_access() {
        let lock = InterruptLock::new(SimulatedInterrupts::new(true));
        let cell = IrqCell::new(vec![1, 2]);
        let guard = lock.acquire();
        cell.with(&guard, |v| v.push(3));
        assert_eq!(cell.with(&guard, |v| v.len()), 3);
    }

    #[test]
    fn nested_access_is_refused() {
        let lock = InterruptLock::new(SimulatedInterrupts::new(true));
        let cell = IrqCell::new(0_u32);
        let guard = lock.acquire();
        let inner = cell.with(&guard, |_| cell.try_with(&guard, |v| *v));
        assert_eq!(inner, None);
        assert_eq!(cell.try_with(&guard, |v| *v), Some(0));
    }

    #[test]
    #[should_panic(expected = "re-entrantly")]
    fn nested_with_panics() {
        let lock = InterruptLock::new(SimulatedInterrupts::new(true));
        let cell = IrqCell::new(0_u32);
        let guard = lock.acquire();
        cell.with(&guard, |_| cell.with(&guard, |v| *v));
    }
}
