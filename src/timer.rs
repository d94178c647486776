//! Timer reference counting (Design Notes §9, invariants #4/#5). The
//! original increments an atomic `timer_active` when a timer is armed and
//! decrements it on every exit path of the callback; `free_task` busy-polls
//! it to zero before tearing down. The idiomatic replacement here is a
//! drop-based guard: arming a timer returns a [`TimerGuard`] whose `Drop`
//! does the decrement, so every exit path — including an early `return` or
//! a panic unwind — releases its reference automatically.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Shared, clonable handle onto a task's outstanding-timer count.
#[derive(Debug, Clone)]
pub struct TimerActive(Arc<AtomicI32>);

impl Default for TimerActive {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerActive {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI32::new(0)))
    }

    pub fn count(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Arm one timer reference. The returned guard must be held for the
    /// lifetime of that armed timer.
    pub fn arm(&self) -> TimerGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        TimerGuard(self.0.clone())
    }
}

/// Decrements the shared count on drop. `free_task`'s drain loop waits for
/// the last guard across every armed timer to drop.
#[derive(Debug)]
pub struct TimerGuard(Arc<AtomicI32>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
