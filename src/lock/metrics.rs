use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome label passed to [`LockMetrics::lock_wait_finished`] for a grant.
pub const WAIT_GRANTED: &str = "granted";
/// Outcome label for a wait that ended in a deadlock verdict.
pub const WAIT_DEADLOCK: &str = "deadlock";
/// Outcome label for a wait that hit the timeout.
pub const WAIT_TIMEOUT: &str = "timeout";
/// Outcome label for a wait cancelled from another thread.
pub const WAIT_INTERRUPTED: &str = "interrupted";

/// A trait for collecting lock manager metrics.
///
/// Implementors of this trait can track lock creation, waits, and deadlock
/// resolution. All methods must be thread-safe as they may be called from
/// multiple sessions concurrently.
pub trait LockMetrics: Send + Sync {
    /// Records the creation of a record, predicate or page lock object.
    fn record_lock_created(&self);

    /// Records the creation of a table lock object.
    fn table_lock_created(&self);

    /// Records a request entering the wait queue.
    fn lock_wait_started(&self);

    /// Records the end of a wait.
    ///
    /// # Parameters
    /// * `elapsed` - Time spent waiting.
    /// * `outcome` - One of [`WAIT_GRANTED`], [`WAIT_DEADLOCK`],
    ///   [`WAIT_TIMEOUT`] or [`WAIT_INTERRUPTED`].
    fn lock_wait_finished(&self, elapsed: Duration, outcome: &'static str);

    /// Records a resolved deadlock cycle of `cycle_len` transactions.
    fn deadlock_detected(&self, cycle_len: usize);

    /// Records a resize of the lock hash tables.
    fn hash_resized(&self, n_cells: usize);
}

/// A no-op implementation of [`LockMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopLockMetrics;

impl LockMetrics for NoopLockMetrics {
    fn record_lock_created(&self) {}
    fn table_lock_created(&self) {}
    fn lock_wait_started(&self) {}
    fn lock_wait_finished(&self, _elapsed: Duration, _outcome: &'static str) {}
    fn deadlock_detected(&self, _cycle_len: usize) {}
    fn hash_resized(&self, _n_cells: usize) {}
}

/// A thread-safe counter-based implementation of [`LockMetrics`].
#[derive(Default)]
pub struct CounterLockMetrics {
    /// Number of record lock objects created.
    pub record_locks_created: AtomicU64,

    /// Number of table lock objects created.
    pub table_locks_created: AtomicU64,

    /// Number of waits started.
    pub lock_waits: AtomicU64,

    /// Number of waits that ended with a grant.
    pub lock_waits_granted: AtomicU64,

    /// Number of waits that timed out.
    pub lock_wait_timeouts: AtomicU64,

    /// Number of waits ended by a deadlock verdict or an interrupt.
    pub lock_waits_aborted: AtomicU64,

    /// Total time spent waiting, in microseconds.
    pub lock_wait_micros: AtomicU64,

    /// Number of deadlocks resolved.
    pub deadlocks: AtomicU64,

    /// Sum of the lengths of all resolved cycles.
    pub deadlock_cycle_members: AtomicU64,

    /// Number of hash table resizes.
    pub hash_resizes: AtomicU64,
}

impl LockMetrics for CounterLockMetrics {
    fn record_lock_created(&self) {
        self.record_locks_created.fetch_add(1, Ordering::Relaxed);
    }

    fn table_lock_created(&self) {
        self.table_locks_created.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_wait_started(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_wait_finished(&self, elapsed: Duration, outcome: &'static str) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.lock_wait_micros.fetch_add(micros, Ordering::Relaxed);
        match outcome {
            WAIT_GRANTED => {
                self.lock_waits_granted.fetch_add(1, Ordering::Relaxed);
            }
            WAIT_TIMEOUT => {
                self.lock_wait_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.lock_waits_aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn deadlock_detected(&self, cycle_len: usize) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
        self.deadlock_cycle_members
            .fetch_add(cycle_len as u64, Ordering::Relaxed);
    }

    fn hash_resized(&self, _n_cells: usize) {
        self.hash_resizes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
pub fn default_metrics() -> Arc<dyn LockMetrics> {
    Arc::new(NoopLockMetrics)
}
