//! Transactional lock manager.
//!
//! [`LockSys`] owns three lock hash tables (record, predicate and R-tree
//! page locks), one queue per locked table, and the wait-for registry used
//! by the deadlock detector. Sessions call into it with their [`Trx`]
//! handle; a request either succeeds at once or leaves a waiting lock behind
//! that the session then blocks on through [`LockSys::lock_wait`].
//!
//! # Latch order
//!
//! Latches are always taken in this order and released in any order:
//!
//! 1. the structural `RwLock` over the hash tables (shared for normal
//!    operations, exclusive only for [`LockSys::resize`]);
//! 2. hash cell groups, record table first, then predicate, then page, and
//!    ascending group index within one table;
//! 3. the table queue map, then a single table queue;
//! 4. the wait registry;
//! 5. a transaction's own lock state.
//!
//! A session never holds its own transaction mutex while blocked on the
//! condition variable and re-acquiring anything above it.

mod bitmap;
mod conflict;
mod deadlock;
mod hash;
mod implicit;
mod metrics;
mod migrate;
mod mode;
mod monitor;
mod object;
mod options;
mod prdt;
mod record;
mod table;
mod trx;
mod wait;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

pub use bitmap::HeapBitmap;
pub use conflict::{
    record_request_conflicts, table_request_conflicts, NoReplication, ReplicationOrderingPolicy,
};
pub use deadlock::{choose_victim, find_cycle, victim_weight, DeadlockMonitor};
pub use implicit::{check_trx_id_sanity, ImplicitLockResolver, InsertCheck, NoImplicitLocks};
pub use metrics::{
    default_metrics, CounterLockMetrics, LockMetrics, NoopLockMetrics, WAIT_DEADLOCK,
    WAIT_GRANTED, WAIT_INTERRUPTED, WAIT_TIMEOUT,
};
pub use mode::{flags, LockMode, TypeMode};
pub use monitor::{LockSnapshot, RecLockInfo, TableLockInfo, WaitEdgeInfo};
pub use object::HashKind;
pub use options::LockSysOptions;
pub use prdt::{prdt_consistent, Mbr, Prdt, PrdtLockKind, PrdtOp};
pub use trx::{IsolationLevel, Trx};

use deadlock::WaitRegistry;
use hash::LockHashes;
use object::LockRef;
use table::TableQueue;
use trx::WaitAbort;

use crate::types::{LockId, TableId};

/// Outcome of a lock request that did not fail.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LockStatus {
    /// Already covered by a lock the transaction holds; nothing changed.
    Granted,
    /// Granted, and a lock object was created or extended.
    GrantedNewLock,
    /// A waiting request was enqueued; call [`LockSys::lock_wait`].
    MustWait,
}

impl LockStatus {
    /// True for both granted variants.
    pub fn is_granted(self) -> bool {
        !matches!(self, LockStatus::MustWait)
    }
}

/// The lock system context.
pub struct LockSys {
    hashes: RwLock<LockHashes>,
    tables: Mutex<FxHashMap<TableId, Arc<Mutex<TableQueue>>>>,
    waits: Mutex<WaitRegistry>,
    next_lock_id: AtomicU64,
    deadlocks: AtomicU64,
    metrics: Arc<dyn LockMetrics>,
    options: LockSysOptions,
}

impl LockSys {
    /// Creates a lock system sized by `options.n_cells`.
    pub fn new(options: LockSysOptions) -> Self {
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        debug!(
            n_cells = options.n_cells,
            latch = ?options.latch,
            lock_wait_timeout_ms = options.lock_wait_timeout.as_millis() as u64,
            deadlock_detect = options.deadlock_detect,
            "lock.sys.create"
        );
        Self {
            hashes: RwLock::new(LockHashes::new(options.n_cells, options.latch)),
            tables: Mutex::new(FxHashMap::default()),
            waits: Mutex::new(WaitRegistry::default()),
            next_lock_id: AtomicU64::new(0),
            deadlocks: AtomicU64::new(0),
            metrics,
            options,
        }
    }

    /// The options this lock system was created with.
    pub fn options(&self) -> &LockSysOptions {
        &self.options
    }

    /// Current number of cells per hash table.
    pub fn n_cells(&self) -> usize {
        self.hashes.read().rec.n_cells()
    }

    /// Number of deadlocks resolved so far.
    pub fn deadlock_count(&self) -> u64 {
        self.deadlocks.load(Ordering::Relaxed)
    }

    /// Rehashes all three lock tables into `n_cells` cells.
    ///
    /// Takes the structural latch exclusively, so it waits for every
    /// in-flight operation to leave the hash tables.
    pub fn resize(&self, n_cells: usize) {
        let mut hashes = self.hashes.write();
        let old = hashes.rec.n_cells();
        hashes.resize(n_cells, self.options.latch);
        let n_cells = hashes.rec.n_cells();
        drop(hashes);
        self.metrics.hash_resized(n_cells);
        debug!(old, n_cells, "lock.sys.resize");
    }

    fn next_id(&self) -> LockId {
        LockId(self.next_lock_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn policy(&self) -> &dyn ReplicationOrderingPolicy {
        self.options.replication.as_ref()
    }

    /// Ends the wait of `trx` on `lock` because it was granted.
    fn wake_granted(&self, trx: &Trx, lock: LockRef) {
        self.waits.lock().clear_edge(trx.id());
        {
            let mut state = trx.lock.lock();
            if state.wait_lock == Some(lock) {
                state.wait_lock = None;
                state.wait_started = None;
            }
        }
        trx.cond.notify_all();
    }

    /// Drops a removed waiting lock from its owner and wakes it, leaving
    /// `abort` as the verdict when given.
    fn wake_cancelled(&self, trx: &Trx, id: LockId, abort: Option<WaitAbort>) {
        self.waits.lock().clear_edge(trx.id());
        trx.lock.lock().detach(id, abort);
        trx.cond.notify_all();
    }
}

impl std::fmt::Debug for LockSys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSys")
            .field("n_cells", &self.n_cells())
            .field("deadlocks", &self.deadlock_count())
            .field("options", &self.options)
            .finish()
    }
}
