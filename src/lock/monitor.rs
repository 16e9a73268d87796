//! Diagnostics: point-in-time snapshots, a monitor-style dump, and a
//! consistency check of the lock queues.

use std::fmt;

use serde::Serialize;
use tracing::error;

use super::conflict::record_request_conflicts;
use super::hash::CellsGuard;
use super::object::{HashKind, RecLock};
use super::prdt::Mbr;
use super::LockSys;
use crate::primitives::latch::SysLatch;
use crate::types::{HeapNo, IndexId, LockError, LockId, PageId, Result, TableId, TrxId};

/// A record, predicate or page lock as seen by [`LockSys::snapshot`].
#[derive(Clone, Debug, Serialize)]
pub struct RecLockInfo {
    /// Lock id.
    pub id: LockId,
    /// Owning transaction.
    pub trx: TrxId,
    /// Hash table the lock lives in.
    pub kind: HashKind,
    /// Page the lock covers.
    pub page: PageId,
    /// Table of the index.
    pub table: TableId,
    /// Index the page belongs to.
    pub index: IndexId,
    /// Mode and flags, as printed by the monitor.
    pub type_mode: String,
    /// Whether the request still waits.
    pub waiting: bool,
    /// Locked heap numbers.
    pub heaps: Vec<HeapNo>,
    /// Locked rectangle of a predicate lock.
    pub mbr: Option<Mbr>,
}

/// A table lock as seen by [`LockSys::snapshot`].
#[derive(Clone, Debug, Serialize)]
pub struct TableLockInfo {
    /// Lock id.
    pub id: LockId,
    /// Owning transaction.
    pub trx: TrxId,
    /// Locked table.
    pub table: TableId,
    /// Mode and flags, as printed by the monitor.
    pub type_mode: String,
    /// Whether the request still waits.
    pub waiting: bool,
}

/// One edge of the wait-for graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct WaitEdgeInfo {
    /// The blocked transaction.
    pub waiter: TrxId,
    /// The transaction it waits for.
    pub blocker: TrxId,
}

/// Every lock and wait edge at one point in time.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LockSnapshot {
    /// Cells per hash table.
    pub n_cells: usize,
    /// Deadlocks resolved so far.
    pub deadlocks: u64,
    /// Record, predicate and page locks.
    pub record_locks: Vec<RecLockInfo>,
    /// Table locks, grouped by table.
    pub table_locks: Vec<TableLockInfo>,
    /// Wait-for edges, by waiter.
    pub waits: Vec<WaitEdgeInfo>,
}

impl LockSnapshot {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Record locks held or requested by `trx`.
    pub fn record_locks_of(&self, trx: TrxId) -> impl Iterator<Item = &RecLockInfo> + '_ {
        self.record_locks.iter().filter(move |l| l.trx == trx)
    }
}

impl From<&RecLock> for RecLockInfo {
    fn from(lock: &RecLock) -> Self {
        Self {
            id: lock.id,
            trx: lock.trx_id(),
            kind: HashKind::of(lock.type_mode),
            page: lock.page,
            table: lock.index.table,
            index: lock.index.id,
            type_mode: lock.type_mode.to_string(),
            waiting: lock.is_waiting(),
            heaps: lock.bits.iter().collect(),
            mbr: lock.prdt.map(|p| p.mbr),
        }
    }
}

impl LockSys {
    /// Copies out every lock and wait edge.
    ///
    /// Each hash table and each table queue is latched in turn, so the
    /// result is consistent per queue but not across queues.
    pub fn snapshot(&self) -> LockSnapshot {
        let mut snap = LockSnapshot {
            deadlocks: self.deadlock_count(),
            ..LockSnapshot::default()
        };
        {
            let hashes = self.hashes.read();
            snap.n_cells = hashes.rec.n_cells();
            for kind in [HashKind::Record, HashKind::Predicate, HashKind::PrdtPage] {
                let cells = hashes.get(kind).latch_all();
                snap.record_locks
                    .extend(cells.chains().flat_map(|c| c.locks.iter()).map(RecLockInfo::from));
            }
        }
        let queues: Vec<_> = self.tables.lock().values().cloned().collect();
        for queue in queues {
            let q = queue.lock();
            snap.table_locks.extend(q.locks.iter().map(|l| TableLockInfo {
                id: l.id,
                trx: l.trx.id(),
                table: l.table,
                type_mode: l.type_mode.to_string(),
                waiting: l.is_waiting(),
            }));
        }
        snap.table_locks.sort_by_key(|l| (l.table, l.id));
        snap.waits = self
            .waits
            .lock()
            .edges()
            .map(|(waiter, blocker)| WaitEdgeInfo { waiter, blocker })
            .collect();
        snap.waits.sort_by_key(|e| e.waiter);
        snap
    }

    /// Checks the queue invariants, logging and returning the first
    /// violation as [`LockError::Corruption`].
    ///
    /// Granted locks precede waiting ones on each page, every waiter waits
    /// for exactly one heap and is its owner's pending request, and no two
    /// granted record locks of different transactions conflict.
    pub fn validate(&self) -> Result<()> {
        {
            let hashes = self.hashes.read();
            let rec = hashes.rec.latch_all();
            let prdt = hashes.prdt.latch_all();
            let prdt_page = hashes.prdt_page.latch_all();
            for cells in [&rec, &prdt, &prdt_page] {
                self.validate_chains(cells)?;
            }
        }
        let queues: Vec<_> = self.tables.lock().values().cloned().collect();
        for queue in queues {
            let q = queue.lock();
            for lock in q.locks.iter().filter(|l| l.is_waiting()) {
                if lock.trx.lock.lock().wait_lock != Some(lock.handle()) {
                    return Err(corrupt(lock.id, "waiting table lock is not its owner's wait"));
                }
            }
            let granted_autoinc = q.locks.iter().find(|l| {
                !l.is_waiting() && l.mode() == super::mode::LockMode::AutoInc
            });
            if granted_autoinc.map(|l| l.trx.id()) != q.autoinc_trx {
                let id = granted_autoinc.map_or(LockId(0), |l| l.id);
                return Err(corrupt(id, "auto-increment holder out of sync"));
            }
        }
        Ok(())
    }

    fn validate_chains(&self, cells: &CellsGuard<'_, SysLatch>) -> Result<()> {
        for chain in cells.chains() {
            for (pos, lock) in chain.locks.iter().enumerate() {
                if lock.bits.is_empty() {
                    return Err(corrupt(lock.id, "lock without bits"));
                }
                if lock.is_waiting() {
                    if lock.bits.count() != 1 {
                        return Err(corrupt(lock.id, "waiting lock on several heaps"));
                    }
                    if lock.trx.lock.lock().wait_lock != Some(lock.handle()) {
                        return Err(corrupt(lock.id, "waiting lock is not its owner's wait"));
                    }
                    continue;
                }
                let ahead = &chain.locks[..pos];
                if ahead.iter().any(|l| l.page == lock.page && l.is_waiting()) {
                    return Err(corrupt(lock.id, "granted lock behind a waiter"));
                }
                if HashKind::of(lock.type_mode) != HashKind::Record {
                    continue;
                }
                for other in ahead
                    .iter()
                    .filter(|l| l.page == lock.page && l.trx_id() != lock.trx_id())
                {
                    let clash = lock.bits.iter().filter(|h| other.has_bit(*h)).any(|heap| {
                        let sup = heap.is_supremum();
                        record_request_conflicts(lock.type_mode, other.type_mode, sup)
                            && record_request_conflicts(other.type_mode, lock.type_mode, sup)
                    });
                    if clash && !self.policy().already_ordered(&lock.trx, &other.trx) {
                        return Err(corrupt(lock.id, "conflicting granted record locks"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn corrupt(id: LockId, what: &'static str) -> LockError {
    error!(lock = id.0, what, "lock.validate.failed");
    LockError::Corruption(what)
}

impl fmt::Display for LockSys {
    /// Writes a dump in the style of an engine status report.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = self.snapshot();
        writeln!(f, "------------")?;
        writeln!(f, "TRANSACTIONS")?;
        writeln!(f, "------------")?;
        writeln!(
            f,
            "lock hash cells {}, deadlocks detected {}",
            snap.n_cells, snap.deadlocks
        )?;
        for lock in &snap.table_locks {
            writeln!(
                f,
                "TABLE LOCK table {} trx id {} {}",
                lock.table.0, lock.trx.0, lock.type_mode
            )?;
        }
        for lock in &snap.record_locks {
            let heading = match lock.kind {
                HashKind::Record => "RECORD LOCKS",
                HashKind::Predicate => "PREDICATE LOCKS",
                HashKind::PrdtPage => "PAGE LOCKS",
            };
            write!(
                f,
                "{heading} page {} index {} of table {} trx id {} {}",
                lock.page.0, lock.index.0, lock.table.0, lock.trx.0, lock.type_mode
            )?;
            if let Some(mbr) = lock.mbr {
                write!(
                    f,
                    " mbr ({} {}, {} {})",
                    mbr.xmin, mbr.ymin, mbr.xmax, mbr.ymax
                )?;
            }
            writeln!(f)?;
            for heap in &lock.heaps {
                writeln!(f, "Record lock, heap no {}", heap.0)?;
            }
        }
        for edge in &snap.waits {
            writeln!(f, "TRX {} WAITS FOR TRX {}", edge.waiter.0, edge.blocker.0)?;
        }
        Ok(())
    }
}
