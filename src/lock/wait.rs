//! Blocking on a pending lock request, and cancelling one.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::metrics::{WAIT_DEADLOCK, WAIT_GRANTED, WAIT_INTERRUPTED, WAIT_TIMEOUT};
use super::object::LockRef;
use super::trx::{Trx, WaitAbort};
use super::{LockStatus, LockSys};
use crate::types::{LockError, Result};

impl LockSys {
    /// Blocks until the pending request of `trx` is resolved.
    ///
    /// Returns `Ok(())` once the request is granted, or when it was
    /// cancelled because the page it waited on was reorganized; the caller
    /// then retries the request. Fails with [`LockError::Deadlock`] when the
    /// transaction was chosen as a victim, [`LockError::LockWaitTimeout`]
    /// after `lock_wait_timeout`, and [`LockError::Interrupted`] after
    /// [`LockSys::cancel`]. In every failing case the waiting request has
    /// been removed.
    pub fn lock_wait(&self, trx: &Arc<Trx>) -> Result<()> {
        if self.options.deadlock_detect {
            self.deadlock_check_pending();
        }
        let started = trx.lock.lock().wait_started.unwrap_or_else(Instant::now);
        let outcome = self.wait_until_resolved(trx);
        let label = match &outcome {
            Ok(()) => WAIT_GRANTED,
            Err(LockError::Deadlock) => WAIT_DEADLOCK,
            Err(LockError::LockWaitTimeout) => WAIT_TIMEOUT,
            Err(_) => WAIT_INTERRUPTED,
        };
        let elapsed = started.elapsed();
        self.metrics.lock_wait_finished(elapsed, label);
        debug!(
            trx = trx.id().0,
            outcome = label,
            waited_us = elapsed.as_micros() as u64,
            "lock.wait.finish"
        );
        outcome
    }

    fn wait_until_resolved(&self, trx: &Arc<Trx>) -> Result<()> {
        let timeout = self.options.lock_wait_timeout;
        let mut state = trx.lock.lock();
        loop {
            if let Some(abort) = state.abort.take() {
                drop(state);
                self.cancel_wait(trx, None);
                return Err(abort.into());
            }
            if state.wait_lock.is_none() {
                return Ok(());
            }
            let started = state.wait_started;
            match started.and_then(|s| s.checked_add(timeout)) {
                Some(deadline) if Instant::now() >= deadline => {
                    drop(state);
                    if self.cancel_wait(trx, None) {
                        warn!(
                            trx = trx.id().0,
                            waited_ms = started.map_or(0, |s| s.elapsed().as_millis() as u64),
                            "lock.wait.timeout"
                        );
                        return Err(LockError::LockWaitTimeout);
                    }
                    state = trx.lock.lock();
                }
                Some(deadline) => {
                    trx.cond.wait_until(&mut state, deadline);
                }
                None => trx.cond.wait(&mut state),
            }
        }
    }

    /// Cancels the pending request of `trx` from another thread. The waiter
    /// wakes with [`LockError::Interrupted`]. Returns false if nothing was
    /// pending.
    pub fn cancel(&self, trx: &Arc<Trx>) -> bool {
        let cancelled = self.cancel_wait(trx, Some(WaitAbort::Interrupted));
        if cancelled {
            debug!(trx = trx.id().0, "lock.wait.interrupt");
        }
        cancelled
    }

    /// Resolves the pending request of `trx` without blocking.
    ///
    /// A deadlock verdict or interrupt is consumed and reported as an error.
    /// A request that is still waiting is withdrawn and reported as
    /// [`LockStatus::MustWait`], so the caller can retry later.
    pub fn trx_handle_wait(&self, trx: &Arc<Trx>) -> Result<LockStatus> {
        let (abort, waiting) = {
            let mut state = trx.lock.lock();
            (state.abort.take(), state.wait_lock.is_some())
        };
        if let Some(abort) = abort {
            self.cancel_wait(trx, None);
            return Err(abort.into());
        }
        if waiting && self.cancel_wait(trx, None) {
            return Ok(LockStatus::MustWait);
        }
        Ok(LockStatus::Granted)
    }

    /// Removes the waiting request of `trx`, if any, and grants what the
    /// removal unblocks. `abort` is left as the verdict for the waiter.
    ///
    /// Waiting for a table lock also releases the AUTO_INC locks the
    /// transaction holds.
    pub(crate) fn cancel_wait(&self, trx: &Arc<Trx>, abort: Option<WaitAbort>) -> bool {
        loop {
            let Some(wait) = trx.lock.lock().wait_lock else {
                return false;
            };
            match wait {
                LockRef::Rec { hash, page, id } => {
                    let hashes = self.hashes.read();
                    let mut cells = hashes.get(hash).latch(page);
                    if trx.lock.lock().wait_lock != Some(wait) {
                        continue;
                    }
                    let chain = cells.chain(page);
                    let Some(pos) = chain.position(id) else {
                        self.clear_stale_wait(trx, wait);
                        return false;
                    };
                    self.rec_cancel(chain, pos, abort);
                    self.rec_grant_waiters(chain, page);
                    return true;
                }
                LockRef::Table { table, id, .. } => {
                    self.release_autoinc_locks(trx);
                    let queue = self.table_queue(table);
                    let mut q = queue.lock();
                    if trx.lock.lock().wait_lock != Some(wait) {
                        continue;
                    }
                    let Some(pos) = q.locks.iter().position(|l| l.id == id) else {
                        self.clear_stale_wait(trx, wait);
                        return false;
                    };
                    self.table_remove(&mut q, pos);
                    debug!(trx = trx.id().0, table = table.0, abort = ?abort, "lock.table.cancel");
                    self.wake_cancelled(trx, id, abort);
                    self.table_grant_waiters(&mut q);
                    drop(q);
                    self.table_prune(table, queue);
                    return true;
                }
            }
        }
    }

    fn clear_stale_wait(&self, trx: &Trx, wait: LockRef) {
        error!(trx = trx.id().0, lock = wait.id().0, "lock.wait.stale_wait_lock");
        self.waits.lock().clear_edge(trx.id());
        let mut state = trx.lock.lock();
        if state.wait_lock == Some(wait) {
            state.wait_lock = None;
            state.wait_started = None;
        }
    }
}
