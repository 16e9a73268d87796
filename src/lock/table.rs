//! Table locks, including AUTO_INC.
//!
//! Each table has a FIFO queue of granted and waiting locks. A request waits
//! behind any lock of another transaction in an incompatible mode, whether
//! that lock is granted or still waiting itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::debug;

use super::deadlock::WaitVerdict;
use super::metrics::WAIT_DEADLOCK;
use super::mode::{flags, LockMode, TypeMode};
use super::object::{HashKind, LockRef, TableLock};
use super::trx::Trx;
use super::{LockStatus, LockSys};
use crate::types::{LockError, LockId, Result, TableId, TrxId};

/// Lock queue of one table.
#[derive(Default, Debug)]
pub(crate) struct TableQueue {
    pub(crate) locks: Vec<TableLock>,
    /// Holder of the granted AUTO_INC lock, if any.
    pub(crate) autoinc_trx: Option<TrxId>,
    pub(crate) n_waiting_or_granted_auto_inc: usize,
}

impl TableQueue {
    fn position(&self, id: LockId) -> Option<usize> {
        self.locks.iter().position(|l| l.id == id)
    }

    /// Last lock of another transaction incompatible with `mode`.
    fn other_has_incompatible(&self, trx: TrxId, mode: LockMode) -> Option<TrxId> {
        self.locks
            .iter()
            .rev()
            .find(|l| l.trx.id() != trx && !mode.compatible(l.mode()))
            .map(|l| l.trx.id())
    }

    /// First lock ahead of `pos` that the lock at `pos` must wait for.
    fn blocker_ahead(&self, pos: usize) -> Option<TrxId> {
        let lock = &self.locks[pos];
        self.locks[..pos]
            .iter()
            .find(|l| l.trx.id() != lock.trx.id() && !lock.mode().compatible(l.mode()))
            .map(|l| l.trx.id())
    }
}

impl LockSys {
    /// The queue of `table`, created on first use. Callers keep the returned
    /// handle for as long as they touch the queue.
    pub(crate) fn table_queue(&self, table: TableId) -> Arc<Mutex<TableQueue>> {
        Arc::clone(self.tables.lock().entry(table).or_default())
    }

    /// Drops the queue of `table` from the map once it is empty and
    /// `queue` is the last handle outside the map.
    pub(crate) fn table_prune(&self, table: TableId, queue: Arc<Mutex<TableQueue>>) {
        let mut tables = self.tables.lock();
        let unshared = Arc::strong_count(&queue) == 2
            && tables.get(&table).is_some_and(|q| Arc::ptr_eq(q, &queue));
        if unshared && queue.lock().locks.is_empty() {
            tables.remove(&table);
        }
    }

    /// Locks `table` in `mode`.
    pub fn lock_table(&self, trx: &Arc<Trx>, table: TableId, mode: LockMode) -> Result<LockStatus> {
        if trx.lock.lock().has_table_lock(table, mode) {
            return Ok(LockStatus::Granted);
        }
        let queue = self.table_queue(table);
        let mut q = queue.lock();
        match q.other_has_incompatible(trx.id(), mode) {
            Some(blocker) => self.table_enqueue_waiting(&mut q, trx, table, mode, blocker),
            None => {
                self.table_create(&mut q, trx, table, TypeMode::new(mode));
                Ok(LockStatus::GrantedNewLock)
            }
        }
    }

    fn table_create(
        &self,
        q: &mut TableQueue,
        trx: &Arc<Trx>,
        table: TableId,
        type_mode: TypeMode,
    ) -> LockId {
        let lock = TableLock {
            id: self.next_id(),
            trx: Arc::clone(trx),
            table,
            type_mode,
        };
        let handle = lock.handle();
        let autoinc = lock.mode() == LockMode::AutoInc;
        if autoinc {
            q.n_waiting_or_granted_auto_inc += 1;
            if !type_mode.is_waiting() {
                q.autoinc_trx = Some(trx.id());
            }
        }
        q.locks.push(lock);
        {
            let mut state = trx.lock.lock();
            state.locks.push(handle);
            if type_mode.is_waiting() {
                state.wait_lock = Some(handle);
                state.wait_started.get_or_insert_with(Instant::now);
            } else if autoinc {
                state.autoinc_locks.push(handle);
            }
        }
        self.metrics.table_lock_created();
        handle.id()
    }

    fn table_enqueue_waiting(
        &self,
        q: &mut TableQueue,
        trx: &Arc<Trx>,
        table: TableId,
        mode: LockMode,
        blocker: TrxId,
    ) -> Result<LockStatus> {
        if self.options.lock_wait_timeout.is_zero() {
            debug!(
                trx = trx.id().0,
                table = table.0,
                blocker = blocker.0,
                "lock.table.nowait_conflict"
            );
            return Err(LockError::LockWaitTimeout);
        }
        let id = self.table_create(q, trx, table, TypeMode::with_flags(mode, flags::WAIT));
        self.metrics.lock_wait_started();
        debug!(
            trx = trx.id().0,
            table = table.0,
            mode = %mode,
            blocker = blocker.0,
            "lock.table.enqueue_waiting"
        );
        match self.register_wait(trx, blocker) {
            WaitVerdict::Wait => Ok(LockStatus::MustWait),
            WaitVerdict::Victim => {
                if let Some(pos) = q.position(id) {
                    self.table_remove(q, pos);
                    self.table_grant_waiters(q);
                }
                trx.lock.lock().detach(id, None);
                self.metrics.lock_wait_finished(Duration::ZERO, WAIT_DEADLOCK);
                Err(LockError::Deadlock)
            }
        }
    }

    /// Unlinks the lock at `pos` from the queue and its AUTO_INC
    /// bookkeeping. The owner's state is left to the caller.
    pub(crate) fn table_remove(&self, q: &mut TableQueue, pos: usize) -> TableLock {
        let lock = q.locks.remove(pos);
        if lock.mode() == LockMode::AutoInc {
            if !lock.is_waiting() && q.autoinc_trx == Some(lock.trx.id()) {
                q.autoinc_trx = None;
            }
            q.n_waiting_or_granted_auto_inc = q.n_waiting_or_granted_auto_inc.saturating_sub(1);
        }
        lock
    }

    /// Grants, in queue order, every waiter with no incompatible lock ahead
    /// of it.
    pub(crate) fn table_grant_waiters(&self, q: &mut TableQueue) {
        for pos in 0..q.locks.len() {
            if !q.locks[pos].is_waiting() {
                continue;
            }
            if let Some(blocker) = q.blocker_ahead(pos) {
                self.retarget_wait(q.locks[pos].trx.id(), blocker);
                continue;
            }
            let lock = &mut q.locks[pos];
            lock.type_mode = lock.type_mode.without(flags::WAIT);
            let trx = Arc::clone(&lock.trx);
            let handle = lock.handle();
            let mode = lock.mode();
            let table = lock.table;
            if mode == LockMode::AutoInc {
                q.autoinc_trx = Some(trx.id());
                trx.lock.lock().autoinc_locks.push(handle);
            }
            debug!(trx = trx.id().0, table = table.0, mode = %mode, "lock.table.grant");
            self.wake_granted(&trx, handle);
        }
    }

    /// Removes lock `id` of `trx` from the queue of `table`, granting
    /// waiters behind it. Returns false if the lock was already gone.
    pub(crate) fn table_release(&self, trx: &Arc<Trx>, table: TableId, id: LockId) -> bool {
        let queue = self.table_queue(table);
        let mut q = queue.lock();
        let Some(pos) = q.position(id) else {
            trx.lock.lock().detach(id, None);
            return false;
        };
        let lock = self.table_remove(&mut q, pos);
        if lock.is_waiting() {
            self.wake_cancelled(trx, id, None);
        } else {
            trx.lock.lock().detach(id, None);
        }
        self.table_grant_waiters(&mut q);
        drop(q);
        self.table_prune(table, queue);
        true
    }

    /// Releases the granted AUTO_INC locks of `trx`, newest first.
    pub(crate) fn release_autoinc_locks(&self, trx: &Arc<Trx>) {
        loop {
            let last = trx.lock.lock().autoinc_locks.last().copied();
            match last {
                Some(LockRef::Table { table, id, .. }) => {
                    self.table_release(trx, table, id);
                }
                Some(LockRef::Rec { id, .. }) => {
                    trx.lock.lock().detach(id, None);
                }
                None => break,
            }
        }
    }

    /// Releases AUTO_INC locks at statement end, before the transaction
    /// commits.
    ///
    /// Does nothing while `trx` waits for a lock other than AUTO_INC; that
    /// wait's cancellation releases them instead.
    pub fn unlock_table_autoinc(&self, trx: &Arc<Trx>) {
        let wait = trx.lock.lock().wait_lock;
        match wait {
            None
            | Some(LockRef::Table {
                mode: LockMode::AutoInc,
                ..
            }) => self.release_autoinc_locks(trx),
            Some(_) => {}
        }
    }

    /// Re-creates granted IX locks for a transaction resurrected during
    /// recovery. No conflict check is made.
    pub fn resurrect_table_ix(&self, trx: &Arc<Trx>, tables: &[TableId]) {
        for &table in tables {
            if trx.lock.lock().has_table_lock(table, LockMode::IX) {
                continue;
            }
            let queue = self.table_queue(table);
            let mut q = queue.lock();
            self.table_create(&mut q, trx, table, TypeMode::new(LockMode::IX));
        }
        debug!(trx = trx.id().0, n_tables = tables.len(), "lock.table.resurrect_ix");
    }

    /// Number of lock objects, granted or waiting, queued on `table`.
    pub fn table_n_locks(&self, table: TableId) -> usize {
        let queue = self.tables.lock().get(&table).cloned();
        queue.map_or(0, |q| q.lock().locks.len())
    }

    /// Whether any table, record, predicate or page lock refers to `table`.
    pub fn table_has_locks(&self, table: TableId) -> bool {
        if self.table_n_locks(table) > 0 {
            return true;
        }
        let hashes = self.hashes.read();
        [HashKind::Record, HashKind::Predicate, HashKind::PrdtPage]
            .into_iter()
            .any(|kind| {
                hashes
                    .get(kind)
                    .latch_all()
                    .chains()
                    .any(|chain| chain.locks.iter().any(|l| l.index.table == table))
            })
    }

    /// Holder of the granted AUTO_INC lock of `table`.
    pub fn autoinc_holder(&self, table: TableId) -> Option<TrxId> {
        let queue = self.tables.lock().get(&table).cloned();
        queue.and_then(|q| q.lock().autoinc_trx)
    }

    /// Number of distinct tables on which `trx` holds a granted lock.
    pub fn number_of_tables_locked(&self, trx: &Trx) -> usize {
        let state = trx.lock.lock();
        state
            .locks
            .iter()
            .filter(|r| state.wait_lock != Some(**r))
            .filter_map(|r| match *r {
                LockRef::Table { table, .. } => Some(table),
                LockRef::Rec { .. } => None,
            })
            .collect::<FxHashSet<_>>()
            .len()
    }

    /// Number of heap bits set across the granted record locks of `trx`.
    pub fn number_of_rows_locked(&self, trx: &Trx) -> usize {
        let refs: Vec<LockRef> = {
            let state = trx.lock.lock();
            state
                .locks
                .iter()
                .copied()
                .filter(|r| state.wait_lock != Some(*r))
                .collect()
        };
        let hashes = self.hashes.read();
        refs.into_iter()
            .filter_map(|r| match r {
                LockRef::Rec {
                    hash: HashKind::Record,
                    page,
                    id,
                } => {
                    let mut cells = hashes.rec.latch(page);
                    cells.chain(page).get(id).map(|l| l.bits.count())
                }
                _ => None,
            })
            .sum()
    }
}
