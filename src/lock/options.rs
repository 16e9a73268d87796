use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::conflict::{NoReplication, ReplicationOrderingPolicy};
use super::metrics::LockMetrics;
use crate::primitives::latch::LatchKind;

/// Configuration options supplied when creating a [`super::LockSys`].
#[derive(Clone)]
pub struct LockSysOptions {
    /// Initial number of cells in each lock hash table.
    pub n_cells: usize,
    /// How long a request may wait before failing with a timeout. Zero
    /// disables waiting altogether: a conflicting request fails at once.
    pub lock_wait_timeout: Duration,
    /// Whether waiters run cycle detection when they enqueue.
    pub deadlock_detect: bool,
    /// Period of the background re-check of queued transactions.
    pub deadlock_check_interval: Duration,
    /// Number of locks released per hold of the structural latch.
    pub release_interval: usize,
    /// Latch implementation for hash table cells.
    pub latch: LatchKind,
    /// Whether every member of a resolved cycle is logged at warn level.
    pub print_all_deadlocks: bool,
    /// Replication ordering hook.
    pub replication: Arc<dyn ReplicationOrderingPolicy>,
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn LockMetrics>>,
}

impl LockSysOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self {
            n_cells: 1024,
            lock_wait_timeout: Duration::from_secs(50),
            deadlock_detect: true,
            deadlock_check_interval: Duration::from_millis(100),
            release_interval: 1000,
            latch: LatchKind::default(),
            print_all_deadlocks: false,
            replication: Arc::new(NoReplication),
            metrics: None,
        }
    }

    /// Options under which every conflict fails immediately.
    pub fn no_wait() -> Self {
        Self::new().lock_wait_timeout(Duration::ZERO)
    }

    /// Sets the initial number of hash cells.
    pub fn n_cells(mut self, n_cells: usize) -> Self {
        self.n_cells = n_cells.max(1);
        self
    }

    /// Sets the lock wait timeout.
    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Enables or disables synchronous deadlock detection.
    pub fn deadlock_detect(mut self, enabled: bool) -> Self {
        self.deadlock_detect = enabled;
        self
    }

    /// Sets the background deadlock re-check period.
    pub fn deadlock_check_interval(mut self, interval: Duration) -> Self {
        self.deadlock_check_interval = interval;
        self
    }

    /// Sets how many locks are released per structural latch hold.
    pub fn release_interval(mut self, n: usize) -> Self {
        self.release_interval = n.max(1);
        self
    }

    /// Selects the cell latch implementation.
    pub fn latch(mut self, kind: LatchKind) -> Self {
        self.latch = kind;
        self
    }

    /// Logs every member of each resolved deadlock cycle.
    pub fn print_all_deadlocks(mut self, enabled: bool) -> Self {
        self.print_all_deadlocks = enabled;
        self
    }

    /// Installs a replication ordering policy.
    pub fn replication(mut self, policy: Arc<dyn ReplicationOrderingPolicy>) -> Self {
        self.replication = policy;
        self
    }

    /// Installs a metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn LockMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Default for LockSysOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockSysOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockSysOptions")
            .field("n_cells", &self.n_cells)
            .field("lock_wait_timeout", &self.lock_wait_timeout)
            .field("deadlock_detect", &self.deadlock_detect)
            .field("deadlock_check_interval", &self.deadlock_check_interval)
            .field("release_interval", &self.release_interval)
            .field("latch", &self.latch)
            .field("print_all_deadlocks", &self.print_all_deadlocks)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
