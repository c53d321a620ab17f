//! # Interrupt-Safe Locking
//!
//! There is exactly one executing context at a time in this kernel, so the
//! only way for two holders to collide on shared state is an interrupt
//! firing in the middle of a critical section. Every piece of process-wide
//! mutable state (task registry, timer queue, frame allocator, layer
//! routing) is therefore guarded by [`InterruptSafeLock`], which disables
//! interrupts for the duration of the guard and restores the previous
//! interrupt state on drop.
//!
//! Funneling all masking through this one type keeps enable/disable pairs
//! from being scattered (and mismatched) across the tree.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock that disables interrupts while held.
///
/// Prevents the classic self-deadlock:
/// 1. Code acquires lock
/// 2. Interrupt fires
/// 3. Interrupt handler tries to acquire the same lock
/// 4. Deadlock
pub struct InterruptSafeLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for InterruptSafeLock<T> {}
unsafe impl<T: Send> Send for InterruptSafeLock<T> {}

impl<T> InterruptSafeLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, returning a guard that restores the interrupt
    /// state on drop.
    pub fn lock(&self) -> InterruptSafeLockGuard<'_, T> {
        // Interrupts must be off before the flag is taken; an interrupt
        // between the two would observe the lock held by its own context.
        let were_enabled = interrupts_enabled();
        disable_interrupts();

        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        InterruptSafeLockGuard {
            lock: self,
            restore_interrupts: were_enabled,
        }
    }
}

pub struct InterruptSafeLockGuard<'a, T> {
    lock: &'a InterruptSafeLock<T>,
    restore_interrupts: bool,
}

impl<'a, T> Drop for InterruptSafeLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.restore_interrupts {
            enable_interrupts();
        }
    }
}

impl<'a, T> core::ops::Deref for InterruptSafeLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> core::ops::DerefMut for InterruptSafeLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// Check whether hardware interrupts are currently enabled
#[inline]
pub fn interrupts_enabled() -> bool {
    #[cfg(not(test))]
    {
        x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(test)]
    {
        false
    }
}

/// Disable hardware interrupts
#[inline]
pub fn disable_interrupts() {
    #[cfg(not(test))]
    x86_64::instructions::interrupts::disable();
}

/// Enable hardware interrupts
#[inline]
pub fn enable_interrupts() {
    #[cfg(not(test))]
    x86_64::instructions::interrupts::enable();
}

/// Run `f` with interrupts masked, restoring the previous state afterwards.
///
/// This is the check-then-act primitive: anything that inspects shared
/// state and then suspends on the result of that inspection must do both
/// under one masked section or a wakeup can be lost in between.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let were_enabled = interrupts_enabled();
    disable_interrupts();
    let result = f();
    if were_enabled {
        enable_interrupts();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_basic() {
        let lock = InterruptSafeLock::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
        }
        // Lock is released once the guard drops
        let mut guard = lock.lock();
        *guard = 7;
        drop(guard);
        assert_eq!(*lock.lock(), 7);
    }

    #[test]
    fn test_without_interrupts_passes_result() {
        let x = without_interrupts(|| 5 + 5);
        assert_eq!(x, 10);
    }
}
