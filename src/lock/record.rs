//! Record lock acquisition, queueing and release.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::bitmap::HeapBitmap;
use super::conflict::{lock_has_to_wait, rec_has_to_wait};
use super::deadlock::WaitVerdict;
use super::hash::LockChain;
use super::metrics::WAIT_DEADLOCK;
use super::mode::{flags, LockMode, TypeMode};
use super::object::{HashKind, LockRef, RecLock};
use super::prdt::Prdt;
use super::trx::{Trx, TrxLockState, WaitAbort};
use super::{LockStatus, LockSys};
use crate::types::{HeapNo, IndexRef, LockError, LockId, PageId, Result, TrxId};

/// Where and how a record lock is requested.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RecRequest {
    pub(crate) type_mode: TypeMode,
    pub(crate) index: IndexRef,
    pub(crate) page: PageId,
    pub(crate) heap: HeapNo,
}

fn validate_record_mode(type_mode: TypeMode) -> Result<()> {
    if !matches!(type_mode.mode(), LockMode::S | LockMode::X) {
        return Err(LockError::Invalid("record locks must be S or X"));
    }
    if type_mode.flags() & !(flags::GAP | flags::REC_NOT_GAP | flags::INSERT_INTENTION) != 0 {
        return Err(LockError::Invalid("unsupported flag on record lock request"));
    }
    if type_mode.is_gap() && type_mode.is_rec_not_gap() {
        return Err(LockError::Invalid("GAP and REC_NOT_GAP are mutually exclusive"));
    }
    if type_mode.is_insert_intention() && !type_mode.is_gap() {
        return Err(LockError::Invalid("insert intention requires GAP"));
    }
    Ok(())
}

/// Finds a granted lock of `trx` on the heap that covers `precise`.
pub(crate) fn rec_has_expl(
    chain: &LockChain,
    trx: TrxId,
    precise: TypeMode,
    page: PageId,
    heap: HeapNo,
) -> Option<LockId> {
    let on_supremum = heap.is_supremum();
    chain
        .iter_heap(page, heap)
        .find(|l| {
            l.trx_id() == trx
                && !l.type_mode.is_insert_intention()
                && !l.is_waiting()
                && l.mode().stronger_or_eq(precise.mode())
                && (!l.type_mode.is_rec_not_gap() || precise.is_rec_not_gap() || on_supremum)
                && (!l.type_mode.is_gap() || precise.is_gap() || on_supremum)
        })
        .map(|l| l.id)
}

impl LockSys {
    /// Locks one record (or the gap before it) in `type_mode`.
    ///
    /// `type_mode` is S or X, optionally combined with `GAP`,
    /// `REC_NOT_GAP` or `GAP | INSERT_INTENTION`. Locks on the supremum
    /// are always gap locks.
    pub fn lock_record(
        &self,
        trx: &Arc<Trx>,
        type_mode: TypeMode,
        index: IndexRef,
        page: PageId,
        heap: HeapNo,
    ) -> Result<LockStatus> {
        self.rec_lock(
            false,
            trx,
            RecRequest {
                type_mode,
                index,
                page,
                heap,
            },
        )
    }

    /// With `implicit` set, no lock is created unless the request has to
    /// wait; the caller relies on an implicit lock instead.
    pub(crate) fn rec_lock(
        &self,
        implicit: bool,
        trx: &Arc<Trx>,
        req: RecRequest,
    ) -> Result<LockStatus> {
        validate_record_mode(req.type_mode)?;
        if trx
            .lock
            .lock()
            .has_table_lock(req.index.table, req.type_mode.mode())
        {
            return Ok(LockStatus::Granted);
        }

        let hashes = self.hashes.read();
        let mut cells = hashes.rec.latch(req.page);
        let chain = cells.chain(req.page);

        let mut on_page = chain
            .locks
            .iter()
            .enumerate()
            .filter(|(_, l)| l.page == req.page)
            .map(|(i, _)| i);
        let first = on_page.next();
        let second = on_page.next();
        match (first, second) {
            (None, _) => {
                if !implicit {
                    self.rec_create(chain, trx, req, None);
                    return Ok(LockStatus::GrantedNewLock);
                }
                return Ok(LockStatus::Granted);
            }
            (Some(pos), None)
                if chain.locks[pos].trx_id() == trx.id()
                    && chain.locks[pos].type_mode == req.type_mode =>
            {
                if !implicit && chain.locks[pos].bits.set(req.heap) {
                    return Ok(LockStatus::GrantedNewLock);
                }
                return Ok(LockStatus::Granted);
            }
            _ => {}
        }

        if rec_has_expl(chain, trx.id(), req.type_mode, req.page, req.heap).is_some() {
            return Ok(LockStatus::Granted);
        }
        if let Some(blocker) =
            self.rec_other_has_conflicting(chain, trx, req.type_mode, req.page, req.heap)
        {
            return self.rec_enqueue_waiting(chain, trx, req, None, blocker);
        }
        if implicit {
            return Ok(LockStatus::Granted);
        }
        self.rec_add_to_queue(chain, trx, req);
        Ok(LockStatus::GrantedNewLock)
    }

    /// First other transaction whose lock on the heap, granted or waiting,
    /// blocks the request.
    pub(crate) fn rec_other_has_conflicting(
        &self,
        chain: &LockChain,
        trx: &Trx,
        type_mode: TypeMode,
        page: PageId,
        heap: HeapNo,
    ) -> Option<TrxId> {
        let on_supremum = heap.is_supremum();
        chain
            .iter_heap(page, heap)
            .find(|l| rec_has_to_wait(self.policy(), trx, type_mode, l, on_supremum))
            .map(RecLock::trx_id)
    }

    /// Creates a lock object with a single bit set and links it to `trx`.
    pub(crate) fn rec_create(
        &self,
        chain: &mut LockChain,
        trx: &Arc<Trx>,
        req: RecRequest,
        prdt: Option<Prdt>,
    ) -> LockId {
        let mut state = trx.lock.lock();
        self.rec_create_in(chain, trx, &mut state, req, prdt)
    }

    /// [`Self::rec_create`] with the owner's lock state already held.
    fn rec_create_in(
        &self,
        chain: &mut LockChain,
        trx: &Arc<Trx>,
        state: &mut TrxLockState,
        req: RecRequest,
        prdt: Option<Prdt>,
    ) -> LockId {
        let mut type_mode = req.type_mode;
        if req.heap.is_supremum() && HashKind::of(type_mode) == HashKind::Record {
            type_mode = type_mode.without(flags::GAP | flags::REC_NOT_GAP);
        }
        let id = self.next_id();
        let lock = RecLock {
            id,
            trx: Arc::clone(trx),
            page: req.page,
            index: req.index,
            type_mode,
            bits: HeapBitmap::with_bit(req.heap),
            prdt,
        };
        let handle = lock.handle();
        chain.insert(lock);
        state.locks.push(handle);
        if type_mode.is_waiting() {
            state.wait_lock = Some(handle);
            state.wait_started.get_or_insert_with(Instant::now);
        }
        self.metrics.record_lock_created();
        id
    }

    /// Adds a record lock without checking for conflicts, reusing a lock of
    /// the same transaction and type when no one waits on the heap.
    pub(crate) fn rec_add_to_queue(
        &self,
        chain: &mut LockChain,
        trx: &Arc<Trx>,
        req: RecRequest,
    ) -> LockId {
        let mut state = trx.lock.lock();
        self.rec_add_to_queue_in(chain, trx, &mut state, req)
    }

    /// [`Self::rec_add_to_queue`] with the owner's lock state already held.
    pub(crate) fn rec_add_to_queue_in(
        &self,
        chain: &mut LockChain,
        trx: &Arc<Trx>,
        state: &mut TrxLockState,
        mut req: RecRequest,
    ) -> LockId {
        if req.heap.is_supremum() {
            req.type_mode = req.type_mode.without(flags::GAP | flags::REC_NOT_GAP);
        }
        if !req.type_mode.is_waiting()
            && !chain
                .iter_heap(req.page, req.heap)
                .any(RecLock::is_waiting)
        {
            if let Some(similar) = chain.locks.iter_mut().find(|l| {
                l.page == req.page
                    && l.trx_id() == trx.id()
                    && l.type_mode == req.type_mode
                    && l.index == req.index
            }) {
                similar.bits.set(req.heap);
                return similar.id;
            }
        }
        self.rec_create_in(chain, trx, state, req, None)
    }

    /// Enqueues a waiting request and runs deadlock detection.
    pub(crate) fn rec_enqueue_waiting(
        &self,
        chain: &mut LockChain,
        trx: &Arc<Trx>,
        req: RecRequest,
        prdt: Option<Prdt>,
        blocker: TrxId,
    ) -> Result<LockStatus> {
        if self.options.lock_wait_timeout.is_zero() {
            debug!(
                trx = trx.id().0,
                blocker = blocker.0,
                page = req.page.0,
                heap = req.heap.0,
                "lock.rec.nowait_conflict"
            );
            return Err(LockError::LockWaitTimeout);
        }
        let req = RecRequest {
            type_mode: req.type_mode.with(flags::WAIT),
            ..req
        };
        let id = self.rec_create(chain, trx, req, prdt);
        self.metrics.lock_wait_started();
        debug!(
            trx = trx.id().0,
            blocker = blocker.0,
            page = req.page.0,
            heap = req.heap.0,
            mode = %req.type_mode,
            "lock.rec.enqueue_waiting"
        );
        match self.register_wait(trx, blocker) {
            WaitVerdict::Wait => Ok(LockStatus::MustWait),
            WaitVerdict::Victim => {
                if let Some(pos) = chain.position(id) {
                    chain.remove(pos);
                    self.rec_grant_waiters(chain, req.page);
                }
                trx.lock.lock().detach(id, None);
                self.metrics.lock_wait_finished(Duration::ZERO, WAIT_DEADLOCK);
                Err(LockError::Deadlock)
            }
        }
    }

    /// Rescans the waiters on `page` in chain order, granting each one
    /// that no longer conflicts with anything ahead of it.
    pub(crate) fn rec_grant_waiters(&self, chain: &mut LockChain, page: PageId) {
        let mut pos = 0;
        while pos < chain.locks.len() {
            let lock = &chain.locks[pos];
            if lock.page == page && lock.is_waiting() {
                let waiter = lock.trx_id();
                match self.rec_blocker_ahead(chain, pos) {
                    Some(blocker) => self.retarget_wait(waiter, blocker),
                    None => self.rec_grant(chain, pos),
                }
            }
            pos += 1;
        }
    }

    fn rec_blocker_ahead(&self, chain: &LockChain, pos: usize) -> Option<TrxId> {
        let waiting = &chain.locks[pos];
        let heap = waiting.bits.first_set()?;
        chain.locks[..pos]
            .iter()
            .find(|l| {
                l.page == waiting.page
                    && l.has_bit(heap)
                    && lock_has_to_wait(self.policy(), waiting, l)
            })
            .map(RecLock::trx_id)
    }

    fn rec_grant(&self, chain: &mut LockChain, pos: usize) {
        let lock = &mut chain.locks[pos];
        lock.type_mode = lock.type_mode.without(flags::WAIT);
        let trx = Arc::clone(&lock.trx);
        let handle = lock.handle();
        debug!(
            trx = trx.id().0,
            page = lock.page.0,
            mode = %lock.type_mode,
            "lock.rec.grant"
        );
        chain.promote(pos);
        self.wake_granted(&trx, handle);
    }

    /// Removes a waiting lock and wakes its owner. Other waiters are not
    /// re-examined.
    pub(crate) fn rec_cancel(&self, chain: &mut LockChain, pos: usize, abort: Option<WaitAbort>) {
        let lock = chain.remove(pos);
        debug!(
            trx = lock.trx_id().0,
            page = lock.page.0,
            abort = ?abort,
            "lock.rec.cancel"
        );
        self.wake_cancelled(&lock.trx, lock.id, abort);
    }

    /// Releases one heap of a granted lock of `trx` in `mode` before the
    /// transaction ends, then grants waiters that no longer conflict.
    ///
    /// Returns false, after logging an error, if no such lock exists.
    pub fn unlock_record(
        &self,
        trx: &Arc<Trx>,
        page: PageId,
        heap: HeapNo,
        mode: LockMode,
    ) -> bool {
        let hashes = self.hashes.read();
        let mut cells = hashes.rec.latch(page);
        let chain = cells.chain(page);
        let found = chain.locks.iter().position(|l| {
            l.page == page
                && l.trx_id() == trx.id()
                && !l.is_waiting()
                && l.mode() == mode
                && l.has_bit(heap)
        });
        let Some(pos) = found else {
            error!(
                trx = trx.id().0,
                page = page.0,
                heap = heap.0,
                mode = %mode,
                "lock.rec.unlock_not_found"
            );
            return false;
        };
        chain.locks[pos].bits.clear(heap);
        if chain.locks[pos].bits.is_empty() {
            let lock = chain.remove(pos);
            trx.lock.lock().detach(lock.id, None);
        }
        self.rec_grant_waiters(chain, page);
        true
    }

    /// Releases every lock of a finishing transaction in reverse acquisition
    /// order, granting waiters as queues drain.
    ///
    /// The transaction is marked committed first, so implicit lock
    /// conversion no longer creates locks on its behalf. The structural
    /// latch is dropped every `release_interval` locks.
    pub fn release_all(&self, trx: &Arc<Trx>) {
        trx.mark_committed();
        self.cancel_wait(trx, None);
        let interval = self.options.release_interval.max(1);
        let mut released = 0usize;
        loop {
            let handles = {
                let mut state = trx.lock.lock();
                state.abort = None;
                std::mem::take(&mut state.locks)
            };
            if handles.is_empty() {
                break;
            }
            for batch in handles.rchunks(interval) {
                let hashes = self.hashes.read();
                for handle in batch.iter().rev() {
                    match *handle {
                        LockRef::Rec { hash, page, id } => {
                            let mut cells = hashes.get(hash).latch(page);
                            let chain = cells.chain(page);
                            if let Some(pos) = chain.position(id) {
                                let lock = chain.remove(pos);
                                if lock.is_waiting() {
                                    self.wake_cancelled(trx, id, None);
                                }
                                self.rec_grant_waiters(chain, page);
                                released += 1;
                            }
                        }
                        LockRef::Table { table, id, .. } => {
                            if self.table_release(trx, table, id) {
                                released += 1;
                            }
                        }
                    }
                }
            }
        }
        {
            let mut state = trx.lock.lock();
            state.autoinc_locks.clear();
            state.wait_lock = None;
            state.wait_started = None;
        }
        debug!(trx = trx.id().0, released, "lock.trx.release_all");
    }

    /// Whether `trx` holds a granted `X | REC_NOT_GAP` lock, or a stronger
    /// one, on the record.
    pub fn trx_has_expl_x_lock(&self, trx: &Trx, page: PageId, heap: HeapNo) -> bool {
        let hashes = self.hashes.read();
        let mut cells = hashes.rec.latch(page);
        rec_has_expl(
            cells.chain(page),
            trx.id(),
            TypeMode::rec_not_gap(LockMode::X),
            page,
            heap,
        )
        .is_some()
    }
}
