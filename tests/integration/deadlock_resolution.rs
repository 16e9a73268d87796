//! Deadlock detection and victim selection
//!
//! Cycles are closed both at enqueue time and through a queue change that
//! retargets a wait edge, which only the deferred pass sees.

#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use lockmgr::lock::{
    IsolationLevel, LockMode, LockStatus, LockSys, LockSysOptions, ReplicationOrderingPolicy,
    Trx, TypeMode,
};
use lockmgr::types::{HeapNo, IndexId, IndexRef, LockError, PageId, Result, TableId, TrxId};

const PAGE: PageId = PageId(11);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn setup(options: LockSysOptions) -> Arc<LockSys> {
    init_tracing();
    Arc::new(LockSys::new(options.n_cells(32)))
}

fn trx(id: u64) -> Arc<Trx> {
    Trx::new(TrxId(id), IsolationLevel::RepeatableRead)
}

fn index() -> IndexRef {
    IndexRef::clustered(TableId(1), IndexId(1))
}

fn x(sys: &LockSys, t: &Arc<Trx>, heap: u16) -> Result<LockStatus> {
    sys.lock_record(t, TypeMode::rec_not_gap(LockMode::X), index(), PAGE, HeapNo(heap))
}

fn s(sys: &LockSys, t: &Arc<Trx>, heap: u16) -> Result<LockStatus> {
    sys.lock_record(t, TypeMode::rec_not_gap(LockMode::S), index(), PAGE, HeapNo(heap))
}

#[test]
fn closing_transaction_is_victim_on_equal_weight() -> Result<()> {
    let sys = setup(LockSysOptions::new());
    let a = trx(1);
    let b = trx(2);
    x(&sys, &a, 2)?;
    x(&sys, &b, 3)?;
    assert_eq!(x(&sys, &a, 3)?, LockStatus::MustWait);
    assert_eq!(x(&sys, &b, 2), Err(LockError::Deadlock));
    assert_eq!(sys.deadlock_count(), 1);
    assert!(!b.is_waiting());
    assert!(a.is_waiting());

    sys.release_all(&b);
    sys.lock_wait(&a)?;
    assert_eq!(sys.number_of_rows_locked(&a), 2);
    sys.validate()?;
    Ok(())
}

#[test]
fn lighter_transaction_is_chosen_over_the_initiator() -> Result<()> {
    let sys = setup(LockSysOptions::new());
    let a = trx(1);
    let b = trx(2);
    b.set_undo_no(500);
    x(&sys, &a, 2)?;
    x(&sys, &b, 3)?;
    assert_eq!(x(&sys, &a, 3)?, LockStatus::MustWait);
    assert_eq!(x(&sys, &b, 2)?, LockStatus::MustWait);

    assert_eq!(sys.lock_wait(&a), Err(LockError::Deadlock));
    assert!(b.is_waiting());
    sys.release_all(&a);
    sys.lock_wait(&b)?;
    assert!(sys.trx_has_expl_x_lock(&b, PAGE, HeapNo(2)));
    Ok(())
}

#[test]
fn side_effects_protect_a_transaction() -> Result<()> {
    let sys = setup(LockSysOptions::new());
    let a = trx(1);
    let b = trx(2);
    a.set_undo_no(1000);
    b.set_side_effects(true);
    x(&sys, &a, 2)?;
    x(&sys, &b, 3)?;
    assert_eq!(x(&sys, &b, 2)?, LockStatus::MustWait);
    assert_eq!(x(&sys, &a, 3), Err(LockError::Deadlock));
    sys.release_all(&a);
    sys.lock_wait(&b)?;
    Ok(())
}

struct PriorityFor(TrxId);

impl ReplicationOrderingPolicy for PriorityFor {
    fn is_high_priority(&self, trx: &Trx) -> bool {
        trx.id() == self.0
    }
}

#[test]
fn high_priority_transaction_is_never_the_victim() -> Result<()> {
    let sys = setup(LockSysOptions::new().replication(Arc::new(PriorityFor(TrxId(2)))));
    let a = trx(1);
    let b = trx(2);
    a.set_undo_no(10_000);
    x(&sys, &a, 2)?;
    x(&sys, &b, 3)?;
    assert_eq!(x(&sys, &a, 3)?, LockStatus::MustWait);
    assert_eq!(x(&sys, &b, 2)?, LockStatus::MustWait);
    assert_eq!(sys.lock_wait(&a), Err(LockError::Deadlock));
    sys.release_all(&a);
    sys.lock_wait(&b)?;
    Ok(())
}

#[test]
fn three_way_cycle_loses_exactly_one_member() -> Result<()> {
    let sys = setup(LockSysOptions::new());
    let members: Vec<_> = (1..=3).map(trx).collect();
    for (i, t) in members.iter().enumerate() {
        x(&sys, t, 2 + i as u16)?;
    }
    assert_eq!(x(&sys, &members[0], 3)?, LockStatus::MustWait);
    assert_eq!(x(&sys, &members[1], 4)?, LockStatus::MustWait);
    assert_eq!(x(&sys, &members[2], 2), Err(LockError::Deadlock));
    assert_eq!(sys.deadlock_count(), 1);
    assert!(members[0].is_waiting());
    assert!(members[1].is_waiting());

    sys.release_all(&members[2]);
    sys.lock_wait(&members[1])?;
    sys.release_all(&members[1]);
    sys.lock_wait(&members[0])?;
    sys.validate()?;
    Ok(())
}

/// Builds a cycle that appears only when t1 releases: t3 first waits for
/// t1, then is retargeted to t2, which already waits for t3.
fn retargeted_cycle(sys: &LockSys) -> Result<[Arc<Trx>; 3]> {
    let t1 = trx(1);
    let t2 = trx(2);
    let t3 = trx(3);
    x(sys, &t3, 5)?;
    s(sys, &t1, 4)?;
    s(sys, &t2, 4)?;
    assert_eq!(x(sys, &t3, 4)?, LockStatus::MustWait);
    assert_eq!(x(sys, &t2, 5)?, LockStatus::MustWait);
    assert_eq!(sys.deadlock_count(), 0);
    sys.release_all(&t1);
    Ok([t1, t2, t3])
}

#[test]
fn retargeted_edge_is_checked_by_the_deferred_pass() -> Result<()> {
    let sys = setup(LockSysOptions::new());
    let [_t1, t2, t3] = retargeted_cycle(&sys)?;
    assert_eq!(sys.snapshot().waits.len(), 2);
    assert_eq!(sys.deadlock_check_pending(), 1);
    assert_eq!(sys.deadlock_check_pending(), 0);
    assert_eq!(sys.lock_wait(&t3), Err(LockError::Deadlock));
    sys.release_all(&t3);
    sys.lock_wait(&t2)?;
    Ok(())
}

#[test]
fn background_monitor_breaks_retargeted_cycle() -> Result<()> {
    let sys = setup(LockSysOptions::new().deadlock_check_interval(Duration::from_millis(5)));
    let mut monitor = sys.start_deadlock_monitor();
    let [_t1, t2, t3] = retargeted_cycle(&sys)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while sys.deadlock_count() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    monitor.stop();
    assert_eq!(sys.deadlock_count(), 1);

    assert_eq!(sys.trx_handle_wait(&t3), Err(LockError::Deadlock));
    sys.release_all(&t3);
    assert!(!t2.is_waiting());
    assert!(sys.snapshot().waits.is_empty());
    Ok(())
}

#[test]
fn disabled_detection_falls_back_to_timeout() -> Result<()> {
    let sys = setup(
        LockSysOptions::new()
            .deadlock_detect(false)
            .lock_wait_timeout(Duration::from_millis(30)),
    );
    let a = trx(1);
    let b = trx(2);
    x(&sys, &a, 2)?;
    x(&sys, &b, 3)?;
    assert_eq!(x(&sys, &a, 3)?, LockStatus::MustWait);
    assert_eq!(x(&sys, &b, 2)?, LockStatus::MustWait);
    assert_eq!(sys.lock_wait(&b), Err(LockError::LockWaitTimeout));
    sys.release_all(&b);
    sys.lock_wait(&a)?;
    assert_eq!(sys.deadlock_count(), 0);
    Ok(())
}
