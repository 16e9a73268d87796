#![allow(unsafe_code)]

//! Latch primitives guarding lock hash table cells.
//!
//! A [`Latch`] is a raw mutual-exclusion word with no attached data. Every
//! latch implements [`lock_api::RawMutex`], so data is paired with one
//! through [`Latched`] (a `lock_api::Mutex`). The lock hash table is
//! generic over the latch so the spin and OS-backed variants can be
//! exercised independently.

#[cfg(feature = "latch-elision")]
mod elision;

#[cfg(feature = "latch-elision")]
pub use elision::{ElisionStats, ElidingLatch};

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::{self, GuardNoSend, GuardSend, RawMutex};

/// Mutual exclusion capability used by the lock hash table.
pub trait Latch: RawMutex + Send + Sync {}

impl<R: RawMutex + Send + Sync> Latch for R {}

/// Data protected by a latch of type `L`.
pub type Latched<L, T> = lock_api::Mutex<L, T>;

/// RAII guard over a [`Latched`] value.
pub type LatchGuard<'a, L, T> = lock_api::MutexGuard<'a, L, T>;

const SPINS_BEFORE_YIELD: u32 = 64;

/// Test-and-test-and-set spin latch.
#[derive(Default)]
pub struct SpinLatch {
    locked: AtomicBool,
}

impl SpinLatch {
    /// Creates an unlocked spin latch.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

// SAFETY: `locked` is taken with an acquiring compare-exchange and cleared
// with a releasing store, so at most one holder exists at a time.
unsafe impl RawMutex for SpinLatch {
    const INIT: Self = SpinLatch::new();

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let mut spins = 0u32;
        loop {
            if self.try_lock() {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Latch backed by the parking_lot raw mutex (futex-based on Linux).
pub struct OsLatch {
    raw: parking_lot::RawMutex,
}

impl OsLatch {
    /// Creates an unlocked OS latch.
    pub const fn new() -> Self {
        Self {
            raw: <parking_lot::RawMutex as RawMutex>::INIT,
        }
    }
}

impl Default for OsLatch {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: every operation forwards to the parking_lot raw mutex.
unsafe impl RawMutex for OsLatch {
    const INIT: Self = OsLatch::new();

    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock(&self) {
        self.raw.lock();
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    #[inline]
    unsafe fn unlock(&self) {
        // SAFETY: forwarded precondition, the caller holds the latch.
        unsafe { self.raw.unlock() }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

/// Selects the latch implementation used by a lock system.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum LatchKind {
    /// [`SpinLatch`].
    Spin,
    /// [`OsLatch`].
    #[default]
    Os,
    /// [`ElidingLatch`] wrapped around an [`OsLatch`].
    #[cfg(feature = "latch-elision")]
    Elided,
}

impl LatchKind {
    /// Builds a fresh latch of this kind.
    pub fn new_latch(self) -> SysLatch {
        match self {
            LatchKind::Spin => SysLatch::Spin(SpinLatch::new()),
            LatchKind::Os => SysLatch::Os(OsLatch::new()),
            #[cfg(feature = "latch-elision")]
            LatchKind::Elided => SysLatch::Elided(ElidingLatch::new(OsLatch::new())),
        }
    }
}

/// Latch chosen at runtime through [`LatchKind`].
///
/// `INIT` is the OS variant; other kinds are built with
/// [`LatchKind::new_latch`] and installed via `Latched::from_raw`.
pub enum SysLatch {
    /// Spin variant.
    Spin(SpinLatch),
    /// OS mutex variant.
    Os(OsLatch),
    /// Fast-path variant.
    #[cfg(feature = "latch-elision")]
    Elided(ElidingLatch<OsLatch>),
}

// SAFETY: every operation dispatches to the variant chosen at construction,
// which never changes.
unsafe impl RawMutex for SysLatch {
    const INIT: Self = SysLatch::Os(OsLatch::new());

    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock(&self) {
        match self {
            SysLatch::Spin(l) => l.lock(),
            SysLatch::Os(l) => l.lock(),
            #[cfg(feature = "latch-elision")]
            SysLatch::Elided(l) => l.lock(),
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        match self {
            SysLatch::Spin(l) => l.try_lock(),
            SysLatch::Os(l) => l.try_lock(),
            #[cfg(feature = "latch-elision")]
            SysLatch::Elided(l) => l.try_lock(),
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        // SAFETY: forwarded precondition, the caller holds the latch.
        unsafe {
            match self {
                SysLatch::Spin(l) => l.unlock(),
                SysLatch::Os(l) => l.unlock(),
                #[cfg(feature = "latch-elision")]
                SysLatch::Elided(l) => l.unlock(),
            }
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        match self {
            SysLatch::Spin(l) => l.is_locked(),
            SysLatch::Os(l) => l.is_locked(),
            #[cfg(feature = "latch-elision")]
            SysLatch::Elided(l) => l.is_locked(),
        }
    }
}
