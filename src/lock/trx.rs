//! Transaction handle and its per-transaction lock state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use smallvec::SmallVec;

use super::mode::LockMode;
use super::object::LockRef;
use crate::types::{LockError, LockId, TableId, TrxId};

/// Transaction isolation level, ordered from weakest to strongest.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Each read sees the latest committed state; no gap inheritance for
    /// modifications.
    ReadCommitted,
    /// Consistent snapshot with next-key locking.
    #[default]
    RepeatableRead,
    /// Every plain read takes shared locks.
    Serializable,
}

/// Why a wait was ended by someone other than the granter.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum WaitAbort {
    Deadlock,
    Interrupted,
}

impl From<WaitAbort> for LockError {
    fn from(value: WaitAbort) -> Self {
        match value {
            WaitAbort::Deadlock => LockError::Deadlock,
            WaitAbort::Interrupted => LockError::Interrupted,
        }
    }
}

/// Lock bookkeeping guarded by the transaction's own mutex.
#[derive(Default)]
pub(crate) struct TrxLockState {
    /// Every lock owned, in acquisition order.
    pub(crate) locks: Vec<LockRef>,
    /// The lock request currently waiting, if any.
    pub(crate) wait_lock: Option<LockRef>,
    pub(crate) wait_started: Option<Instant>,
    /// Verdict left by the deadlock resolver or a canceller.
    pub(crate) abort: Option<WaitAbort>,
    /// Granted AUTO_INC locks, in acquisition order.
    pub(crate) autoinc_locks: SmallVec<[LockRef; 4]>,
}

impl TrxLockState {
    /// Forgets lock `id`. Returns true if it was the pending wait.
    pub(crate) fn detach(&mut self, id: LockId, abort: Option<WaitAbort>) -> bool {
        self.locks.retain(|r| r.id() != id);
        self.autoinc_locks.retain(|r| r.id() != id);
        if self.wait_lock.map(LockRef::id) == Some(id) {
            self.wait_lock = None;
            self.wait_started = None;
            if abort.is_some() {
                self.abort = abort;
            }
            true
        } else {
            false
        }
    }

    /// Whether a granted table lock at least as strong as `mode` is held.
    pub(crate) fn has_table_lock(&self, table: TableId, mode: LockMode) -> bool {
        self.locks.iter().any(|r| match *r {
            LockRef::Table {
                table: t,
                mode: held,
                ..
            } => t == table && held.stronger_or_eq(mode) && self.wait_lock != Some(*r),
            LockRef::Rec { .. } => false,
        })
    }
}

/// A transaction as seen by the lock manager.
///
/// The handle is shared between the owning session and every lock it holds;
/// the engine updates undo volume and the side-effects flag as the
/// transaction progresses.
pub struct Trx {
    id: TrxId,
    isolation: IsolationLevel,
    undo_no: AtomicU64,
    side_effects: AtomicBool,
    duplicates: AtomicBool,
    committed: AtomicBool,
    pub(crate) lock: Mutex<TrxLockState>,
    pub(crate) cond: Condvar,
}

impl Trx {
    /// Creates an active transaction.
    pub fn new(id: TrxId, isolation: IsolationLevel) -> Arc<Self> {
        Arc::new(Self {
            id,
            isolation,
            undo_no: AtomicU64::new(0),
            side_effects: AtomicBool::new(false),
            duplicates: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            lock: Mutex::new(TrxLockState::default()),
            cond: Condvar::new(),
        })
    }

    /// Transaction id.
    #[inline]
    pub fn id(&self) -> TrxId {
        self.id
    }

    /// Isolation level.
    #[inline]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Number of undo log records written so far.
    pub fn undo_no(&self) -> u64 {
        self.undo_no.load(Ordering::Relaxed)
    }

    /// Updates the undo volume used for victim weighting.
    pub fn set_undo_no(&self, undo_no: u64) {
        self.undo_no.store(undo_no, Ordering::Relaxed);
    }

    /// Whether the transaction has effects outside the engine (for example
    /// changes to non-transactional tables).
    pub fn has_side_effects(&self) -> bool {
        self.side_effects.load(Ordering::Relaxed)
    }

    /// Marks external side effects.
    pub fn set_side_effects(&self, value: bool) {
        self.side_effects.store(value, Ordering::Relaxed);
    }

    /// Whether the current statement is a REPLACE or duplicate-key check.
    pub fn duplicates(&self) -> bool {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Sets the duplicate-handling flag for the current statement.
    pub fn set_duplicates(&self, value: bool) {
        self.duplicates.store(value, Ordering::Relaxed);
    }

    /// Whether the transaction has committed in memory.
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Set under the lock-state mutex: a lock created on this
    /// transaction's behalf after checking [`Self::is_committed`] under the
    /// same mutex is then always taken by the release that follows.
    pub(crate) fn mark_committed(&self) {
        let _state = self.lock.lock();
        self.committed.store(true, Ordering::Release);
    }

    /// Whether a lock request is pending.
    pub fn is_waiting(&self) -> bool {
        self.lock.lock().wait_lock.is_some()
    }

    /// Number of lock objects owned, granted or waiting.
    pub fn n_locks(&self) -> usize {
        self.lock.lock().locks.len()
    }
}

impl fmt::Debug for Trx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trx")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("undo_no", &self.undo_no())
            .finish()
    }
}
