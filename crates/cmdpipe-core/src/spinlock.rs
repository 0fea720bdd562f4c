//! Spin-lock guarding per-connection pipeline state
//!
//! The critical sections protected by this lock are always O(1) pointer or
//! buffer swaps. The reactor thread must never be parked by the OS while
//! holding or waiting on it, so contention is resolved by spinning with a
//! short pause-hint backoff and then yielding the time slice.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Spins with pause hints before falling back to `yield_now`.
const SPINS_BEFORE_YIELD: u32 = 16;

/// A compare-and-swap spin-lock with cooperative-yield backoff.
///
/// Every failed acquisition attempt bumps a miss counter, which is exposed
/// through [`SpinLock::misses`] for connection stats.
pub struct SpinLock<T> {
    locked: AtomicBool,
    misses: AtomicU64,
    data: UnsafeCell<T>,
}

// Safety: SpinLock provides exclusive access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new spin-lock containing the given value
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            misses: AtomicU64::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning and yielding until it's available
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }
            self.misses.fetch_add(1, Ordering::Relaxed);

            let mut spin_count = 0u32;
            while self.locked.load(Ordering::Relaxed) {
                if spin_count < SPINS_BEFORE_YIELD {
                    spin_count += 1;
                    for _ in 0..(1u32 << spin_count.min(6)) {
                        core::hint::spin_loop();
                    }
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Try to acquire the lock without waiting
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Number of acquisition attempts that found the lock held
    #[inline]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Consume the lock and return the inner value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard that releases the spin-lock when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
