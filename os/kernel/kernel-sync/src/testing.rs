//! Simulated interrupt hardware for host-side tests.

use crate::InterruptControl;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// An interrupt flag that only exists in memory, counting every transition.
#[derive(Debug, Default)]
pub struct SimulatedInterrupts {
    enabled: AtomicBool,
    disables: AtomicUsize,
    enables: AtomicUsize,
}

impl SimulatedInterrupts {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            disables: AtomicUsize::new(0),
            enables: AtomicUsize::new(0),
        }
    }

    /// Number of `disable` calls observed.
    #[must_use]
    pub fn disable_count(&self) -> usize {
        self.disables.load(Ordering::Relaxed)
    }

    /// Number of `enable` calls observed.
    #[must_use]
    pub fn enable_count(&self) -> usize {
        self.enables.load(Ordering::Relaxed)
    }
}

impl InterruptControl for SimulatedInterrupts {
    fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn disable(&self) {
        self.disables.fetch_add(1, Ordering::Relaxed);
        self.enabled.store(false, Ordering::Relaxed);
    }

    fn enable(&self) {
        self.enables.fetch_add(1, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Relaxed);
    }
}
