#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::lock_api::RawMutex;

const DEFAULT_FAST_ATTEMPTS: u32 = 16;

/// Counters describing how often the fast path succeeded.
#[derive(Default, Debug, Clone, Copy)]
pub struct ElisionStats {
    /// Acquisitions satisfied by the non-blocking fast path.
    pub fast: u64,
    /// Acquisitions that fell back to the blocking latch path.
    pub fallback: u64,
}

/// Optimistic fast path in front of another latch.
///
/// Hardware transactional memory is not reachable from stable Rust, so the
/// speculative phase is a bounded run of non-blocking attempts. Any
/// contention falls through to the wrapped latch, which remains the only
/// source of mutual exclusion.
pub struct ElidingLatch<L: RawMutex> {
    inner: L,
    attempts: u32,
    fast: AtomicU64,
    fallback: AtomicU64,
}

impl<L: RawMutex> ElidingLatch<L> {
    /// Wraps `inner` with the default attempt budget.
    pub const fn new(inner: L) -> Self {
        Self::with_attempts(inner, DEFAULT_FAST_ATTEMPTS)
    }

    /// Wraps `inner` with an explicit attempt budget.
    pub const fn with_attempts(inner: L, attempts: u32) -> Self {
        Self {
            inner,
            attempts,
            fast: AtomicU64::new(0),
            fallback: AtomicU64::new(0),
        }
    }

    /// Returns the fast/fallback counters.
    pub fn stats(&self) -> ElisionStats {
        ElisionStats {
            fast: self.fast.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
        }
    }
}

// SAFETY: mutual exclusion comes solely from `inner`; the fast path only
// calls its `try_lock`.
unsafe impl<L: RawMutex> RawMutex for ElidingLatch<L> {
    const INIT: Self = ElidingLatch::new(L::INIT);

    type GuardMarker = L::GuardMarker;

    fn lock(&self) {
        for _ in 0..self.attempts {
            if self.inner.try_lock() {
                self.fast.fetch_add(1, Ordering::Relaxed);
                return;
            }
            std::hint::spin_loop();
        }
        self.fallback.fetch_add(1, Ordering::Relaxed);
        self.inner.lock();
    }

    fn try_lock(&self) -> bool {
        self.inner.try_lock()
    }

    unsafe fn unlock(&self) {
        // SAFETY: forwarded precondition, the caller holds the latch.
        unsafe { self.inner.unlock() }
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}
