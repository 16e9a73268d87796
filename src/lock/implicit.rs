//! Implicit record locks and the insert, modify and read entry points.
//!
//! A transaction that inserted or last modified a record owns an implicit
//! exclusive lock on it for as long as it is active; no lock object exists.
//! Before another transaction may queue on such a record, the implicit lock
//! is made explicit on the owner's behalf.

use std::sync::Arc;

use tracing::{debug, error};

use super::mode::{flags, LockMode, TypeMode};
use super::record::{rec_has_expl, RecRequest};
use super::trx::Trx;
use super::{LockStatus, LockSys};
use crate::types::{HeapNo, IndexRef, LockError, PageId, Result, TrxId};

/// Reports which active transaction implicitly owns a record.
///
/// The storage engine implements this from the record's transaction id
/// column (clustered index) or from the page's max transaction id and undo
/// logs (secondary index).
pub trait ImplicitLockResolver: Send + Sync {
    /// The owner of the implicit lock on `heap`, or `None` when the record
    /// was last written by a transaction that is no longer active.
    fn implicit_owner(
        &self,
        index: &IndexRef,
        page: PageId,
        heap: HeapNo,
    ) -> Result<Option<Arc<Trx>>>;
}

/// Resolver for engines that never leave implicit locks.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoImplicitLocks;

impl ImplicitLockResolver for NoImplicitLocks {
    fn implicit_owner(&self, _: &IndexRef, _: PageId, _: HeapNo) -> Result<Option<Arc<Trx>>> {
        Ok(None)
    }
}

/// Result of [`LockSys::insert_check_and_lock`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct InsertCheck {
    /// Whether the insert may proceed or has to wait.
    pub status: LockStatus,
    /// Whether the successor record is locked, in which case the caller
    /// must let the new record inherit gap locks after inserting it.
    pub inherit: bool,
}

/// Rejects a transaction id read from a record that is not below the next
/// id to be assigned.
pub fn check_trx_id_sanity(trx_id: TrxId, max_trx_id: TrxId) -> Result<()> {
    if trx_id >= max_trx_id {
        error!(
            trx_id = trx_id.0,
            max_trx_id = max_trx_id.0,
            "lock.implicit.trx_id_in_future"
        );
        return Err(LockError::Corruption("transaction id in the future"));
    }
    Ok(())
}

impl LockSys {
    /// Makes the implicit lock on a record explicit if another active
    /// transaction owns it. Returns true when `trx` itself is the owner.
    fn convert_impl_to_expl(
        &self,
        trx: &Trx,
        resolver: &dyn ImplicitLockResolver,
        index: IndexRef,
        page: PageId,
        heap: HeapNo,
    ) -> Result<bool> {
        let Some(owner) = resolver.implicit_owner(&index, page, heap)? else {
            return Ok(false);
        };
        if owner.id() == trx.id() {
            return Ok(true);
        }
        let type_mode = TypeMode::rec_not_gap(LockMode::X);
        let hashes = self.hashes.read();
        let mut cells = hashes.rec.latch(page);
        let mut state = owner.lock.lock();
        if owner.is_committed() {
            return Ok(false);
        }
        let chain = cells.chain(page);
        if rec_has_expl(chain, owner.id(), type_mode, page, heap).is_none() {
            self.rec_add_to_queue_in(
                chain,
                &owner,
                &mut state,
                RecRequest {
                    type_mode,
                    index,
                    page,
                    heap,
                },
            );
            debug!(
                owner = owner.id().0,
                requester = trx.id().0,
                page = page.0,
                heap = heap.0,
                "lock.rec.convert_implicit"
            );
        }
        Ok(false)
    }

    /// Checks whether a record may be inserted before `next_heap`.
    ///
    /// Waits only for gap locks of other transactions on the successor. A
    /// successful check creates no lock.
    pub fn insert_check_and_lock(
        &self,
        trx: &Arc<Trx>,
        index: IndexRef,
        page: PageId,
        next_heap: HeapNo,
    ) -> Result<InsertCheck> {
        let hashes = self.hashes.read();
        let mut cells = hashes.rec.latch(page);
        let chain = cells.chain(page);
        if chain.iter_heap(page, next_heap).next().is_none() {
            return Ok(InsertCheck {
                status: LockStatus::Granted,
                inherit: false,
            });
        }
        let type_mode = TypeMode::insert_intention();
        let status = match self.rec_other_has_conflicting(chain, trx, type_mode, page, next_heap) {
            Some(blocker) => {
                let req = RecRequest {
                    type_mode,
                    index,
                    page,
                    heap: next_heap,
                };
                self.rec_enqueue_waiting(chain, trx, req, None, blocker)?
            }
            None => LockStatus::Granted,
        };
        Ok(InsertCheck {
            status,
            inherit: true,
        })
    }

    /// Checks whether a clustered index record may be modified or
    /// delete-marked. No lock is created unless the request has to wait.
    pub fn clust_rec_modify_check_and_lock(
        &self,
        trx: &Arc<Trx>,
        resolver: &dyn ImplicitLockResolver,
        index: IndexRef,
        page: PageId,
        heap: HeapNo,
    ) -> Result<LockStatus> {
        if !index.clustered {
            return Err(LockError::Invalid("clustered index expected"));
        }
        if self.convert_impl_to_expl(trx, resolver, index, page, heap)? {
            return Ok(LockStatus::Granted);
        }
        self.modify_lock(trx, index, page, heap)
    }

    /// Checks whether a secondary index record may be delete-marked.
    ///
    /// Another transaction cannot hold an implicit lock here: the clustered
    /// record was already modified under an exclusive lock.
    pub fn sec_rec_modify_check_and_lock(
        &self,
        trx: &Arc<Trx>,
        index: IndexRef,
        page: PageId,
        heap: HeapNo,
    ) -> Result<LockStatus> {
        if index.clustered {
            return Err(LockError::Invalid("secondary index expected"));
        }
        self.modify_lock(trx, index, page, heap)
    }

    fn modify_lock(
        &self,
        trx: &Arc<Trx>,
        index: IndexRef,
        page: PageId,
        heap: HeapNo,
    ) -> Result<LockStatus> {
        let req = RecRequest {
            type_mode: TypeMode::rec_not_gap(LockMode::X),
            index,
            page,
            heap,
        };
        Ok(match self.rec_lock(true, trx, req)? {
            LockStatus::GrantedNewLock => LockStatus::Granted,
            status => status,
        })
    }

    /// Locks a clustered index record for a locking read.
    ///
    /// `gap_mode` is `0` (next-key), [`flags::GAP`] or
    /// [`flags::REC_NOT_GAP`].
    #[allow(clippy::too_many_arguments)]
    pub fn clust_rec_read_check_and_lock(
        &self,
        trx: &Arc<Trx>,
        resolver: &dyn ImplicitLockResolver,
        index: IndexRef,
        page: PageId,
        heap: HeapNo,
        mode: LockMode,
        gap_mode: u32,
    ) -> Result<LockStatus> {
        if !index.clustered {
            return Err(LockError::Invalid("clustered index expected"));
        }
        self.read_lock(trx, resolver, index, page, heap, mode, gap_mode)
    }

    /// Locks a secondary index record for a locking read.
    #[allow(clippy::too_many_arguments)]
    pub fn sec_rec_read_check_and_lock(
        &self,
        trx: &Arc<Trx>,
        resolver: &dyn ImplicitLockResolver,
        index: IndexRef,
        page: PageId,
        heap: HeapNo,
        mode: LockMode,
        gap_mode: u32,
    ) -> Result<LockStatus> {
        if index.clustered {
            return Err(LockError::Invalid("secondary index expected"));
        }
        self.read_lock(trx, resolver, index, page, heap, mode, gap_mode)
    }

    #[allow(clippy::too_many_arguments)]
    fn read_lock(
        &self,
        trx: &Arc<Trx>,
        resolver: &dyn ImplicitLockResolver,
        index: IndexRef,
        page: PageId,
        heap: HeapNo,
        mode: LockMode,
        gap_mode: u32,
    ) -> Result<LockStatus> {
        if gap_mode & !(flags::GAP | flags::REC_NOT_GAP) != 0 {
            return Err(LockError::Invalid("gap_mode must be 0, GAP or REC_NOT_GAP"));
        }
        if !heap.is_supremum() && self.convert_impl_to_expl(trx, resolver, index, page, heap)? {
            return Ok(LockStatus::Granted);
        }
        let req = RecRequest {
            type_mode: TypeMode::with_flags(mode, gap_mode),
            index,
            page,
            heap,
        };
        self.rec_lock(false, trx, req)
    }
}
