//! Conflict rules between a lock request and a lock already in a queue.

use super::mode::{LockMode, TypeMode};
use super::object::RecLock;
use super::prdt::{prdt_consistent, Prdt};
use super::trx::Trx;

/// Hook for replicated setups where commit order is fixed externally.
///
/// Both methods default to "no opinion", which is the behavior of a
/// stand-alone server.
pub trait ReplicationOrderingPolicy: Send + Sync {
    /// Returns true if `requester` is already ordered after `holder`, so the
    /// conflict between them must not cause a wait.
    fn already_ordered(&self, _requester: &Trx, _holder: &Trx) -> bool {
        false
    }

    /// Returns true if `trx` must never be picked as a deadlock victim while
    /// a lower priority candidate exists.
    fn is_high_priority(&self, _trx: &Trx) -> bool {
        false
    }
}

/// Policy for a server without replication ordering.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoReplication;

impl ReplicationOrderingPolicy for NoReplication {}

/// Whether a record lock request of `requested` must wait for a lock of
/// another transaction held (or requested) as `held` on the same heap.
pub fn record_request_conflicts(requested: TypeMode, held: TypeMode, on_supremum: bool) -> bool {
    if requested.mode().compatible(held.mode()) {
        return false;
    }
    // Gap-only requests never conflict.
    if (on_supremum || requested.is_gap()) && !requested.is_insert_intention() {
        return false;
    }
    // Only insert intention waits for gap locks.
    if !requested.is_insert_intention() && held.is_gap() {
        return false;
    }
    if requested.is_gap() && held.is_rec_not_gap() {
        return false;
    }
    if held.is_insert_intention() {
        return false;
    }
    true
}

/// Whether two table lock modes held by different transactions conflict.
pub fn table_request_conflicts(requested: LockMode, held: LockMode) -> bool {
    !requested.compatible(held)
}

pub(crate) fn rec_has_to_wait(
    policy: &dyn ReplicationOrderingPolicy,
    trx: &Trx,
    type_mode: TypeMode,
    lock2: &RecLock,
    on_supremum: bool,
) -> bool {
    trx.id() != lock2.trx_id()
        && record_request_conflicts(type_mode, lock2.type_mode, on_supremum)
        && !policy.already_ordered(trx, &lock2.trx)
}

pub(crate) fn prdt_has_to_wait(
    trx: &Trx,
    type_mode: TypeMode,
    prdt: Option<&Prdt>,
    lock2: &RecLock,
) -> bool {
    if trx.id() == lock2.trx_id() || type_mode.mode().compatible(lock2.mode()) {
        return false;
    }
    if type_mode.is_prdt_page() {
        return true;
    }
    // A predicate lock only conflicts with another predicate lock, and only
    // an insert waits.
    if !lock2.type_mode.is_predicate()
        || !type_mode.is_insert_intention()
        || lock2.type_mode.is_insert_intention()
    {
        return false;
    }
    match (lock2.prdt.as_ref(), prdt) {
        (Some(held), Some(requested)) => prdt_consistent(held, requested, None),
        _ => false,
    }
}

/// Whether the waiting lock `lock1` still has to wait for `lock2`, which
/// precedes it on the same page.
pub(crate) fn lock_has_to_wait(
    policy: &dyn ReplicationOrderingPolicy,
    lock1: &RecLock,
    lock2: &RecLock,
) -> bool {
    if lock1.trx_id() == lock2.trx_id() || lock1.mode().compatible(lock2.mode()) {
        return false;
    }
    if lock1.type_mode.is_predicate() || lock1.type_mode.is_prdt_page() {
        return prdt_has_to_wait(&lock1.trx, lock1.type_mode, lock1.prdt.as_ref(), lock2);
    }
    let on_supremum = lock1.bits.first_set().is_some_and(|h| h.is_supremum());
    rec_has_to_wait(policy, &lock1.trx, lock1.type_mode, lock2, on_supremum)
}
