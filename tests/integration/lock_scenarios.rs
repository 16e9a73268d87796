//! Record and table lock scenarios
//!
//! Exercises the acquisition and release paths through the public API:
//! - Gap locks never block record locks
//! - A blocked request is granted and woken when the holder releases
//! - Next-key, insert intention and supremum interplay
//! - Table locks and AUTO_INC hand-over
//! - Full release restores an empty lock system

#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use lockmgr::lock::{
    CounterLockMetrics, IsolationLevel, LockMode, LockStatus, LockSys, LockSysOptions, Trx,
    TypeMode,
};
use lockmgr::types::{HeapNo, IndexId, IndexRef, PageId, Result, TableId, TrxId};

const PAGE: PageId = PageId(7);
const TABLE: TableId = TableId(3);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn setup() -> Arc<LockSys> {
    init_tracing();
    Arc::new(LockSys::new(LockSysOptions::new().n_cells(64)))
}

fn trx(id: u64) -> Arc<Trx> {
    Trx::new(TrxId(id), IsolationLevel::RepeatableRead)
}

fn clustered() -> IndexRef {
    IndexRef::clustered(TABLE, IndexId(1))
}

#[test]
fn record_lock_is_granted_over_a_gap_lock() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    sys.lock_record(&b, TypeMode::gap(LockMode::S), clustered(), PAGE, HeapNo(5))?;
    let status =
        sys.lock_record(&a, TypeMode::rec_not_gap(LockMode::X), clustered(), PAGE, HeapNo(5))?;
    assert!(status.is_granted());
    assert!(!a.is_waiting());
    sys.validate()?;
    Ok(())
}

#[test]
fn waiter_is_granted_and_woken_on_release() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    sys.lock_record(&a, TypeMode::new(LockMode::X), clustered(), PAGE, HeapNo(4))?;
    let status = sys.lock_record(&b, TypeMode::new(LockMode::S), clustered(), PAGE, HeapNo(4))?;
    assert_eq!(status, LockStatus::MustWait);

    let waiter = {
        let sys = Arc::clone(&sys);
        let b = Arc::clone(&b);
        thread::spawn(move || sys.lock_wait(&b))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(b.is_waiting());
    sys.release_all(&a);
    waiter.join().expect("waiter thread")?;

    assert!(!b.is_waiting());
    assert_eq!(sys.number_of_rows_locked(&b), 1);
    assert_eq!(sys.deadlock_count(), 0);
    sys.validate()?;
    Ok(())
}

#[test]
fn only_one_transaction_holds_an_exclusive_record_lock() -> Result<()> {
    let sys = setup();
    let holders: Vec<_> = (1..=4).map(trx).collect();
    let mut granted = 0;
    for t in &holders {
        let status =
            sys.lock_record(t, TypeMode::rec_not_gap(LockMode::X), clustered(), PAGE, HeapNo(9))?;
        if status.is_granted() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
    let snap = sys.snapshot();
    assert_eq!(snap.record_locks.iter().filter(|l| !l.waiting).count(), 1);
    assert_eq!(snap.waits.len(), 3);
    sys.validate()?;
    for t in &holders {
        sys.release_all(t);
    }
    assert!(sys.snapshot().record_locks.is_empty());
    Ok(())
}

#[test]
fn insert_waits_for_next_key_lock_but_not_for_another_insert() -> Result<()> {
    let sys = setup();
    let reader = trx(1);
    let ins1 = trx(2);
    let ins2 = trx(3);

    let first = sys.insert_check_and_lock(&ins1, clustered(), PAGE, HeapNo(6))?;
    assert_eq!(first.status, LockStatus::Granted);
    assert!(!first.inherit);

    sys.lock_record(&reader, TypeMode::new(LockMode::S), clustered(), PAGE, HeapNo(6))?;
    let blocked = sys.insert_check_and_lock(&ins1, clustered(), PAGE, HeapNo(6))?;
    assert_eq!(blocked.status, LockStatus::MustWait);
    assert!(blocked.inherit);

    // Insert intentions never block each other; both wait for the reader.
    let second = sys.insert_check_and_lock(&ins2, clustered(), PAGE, HeapNo(6))?;
    assert_eq!(second.status, LockStatus::MustWait);

    sys.release_all(&reader);
    assert!(!ins1.is_waiting());
    assert!(!ins2.is_waiting());
    sys.validate()?;
    Ok(())
}

#[test]
fn supremum_locks_never_conflict_with_each_other() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    let st = sys.lock_record(&a, TypeMode::new(LockMode::X), clustered(), PAGE, HeapNo::SUPREMUM)?;
    assert!(st.is_granted());
    let st = sys.lock_record(&b, TypeMode::new(LockMode::X), clustered(), PAGE, HeapNo::SUPREMUM)?;
    assert!(st.is_granted());
    let printed = sys.to_string();
    assert!(!printed.contains("locks rec but not gap"));
    Ok(())
}

#[test]
fn shared_table_lock_waits_for_intention_exclusive() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    let c = trx(3);
    sys.lock_table(&a, TABLE, LockMode::IX)?;
    assert_eq!(sys.lock_table(&b, TABLE, LockMode::IX)?, LockStatus::GrantedNewLock);
    assert_eq!(sys.lock_table(&c, TABLE, LockMode::S)?, LockStatus::MustWait);
    // Reuse: IS is covered by IX.
    assert_eq!(sys.lock_table(&a, TABLE, LockMode::IS)?, LockStatus::Granted);
    sys.release_all(&a);
    assert!(c.is_waiting());
    sys.release_all(&b);
    assert!(!c.is_waiting());
    assert_eq!(sys.number_of_tables_locked(&c), 1);
    Ok(())
}

#[test]
fn autoinc_lock_passes_to_next_statement() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    sys.lock_table(&a, TABLE, LockMode::AutoInc)?;
    assert_eq!(sys.autoinc_holder(TABLE), Some(TrxId(1)));
    assert_eq!(sys.lock_table(&b, TABLE, LockMode::AutoInc)?, LockStatus::MustWait);
    sys.unlock_table_autoinc(&a);
    assert_eq!(sys.autoinc_holder(TABLE), Some(TrxId(2)));
    sys.validate()?;
    Ok(())
}

#[test]
fn release_leaves_nothing_behind() -> Result<()> {
    init_tracing();
    let metrics = Arc::new(CounterLockMetrics::default());
    let sys = LockSys::new(LockSysOptions::new().n_cells(8).metrics(metrics.clone()));
    let a = trx(1);
    sys.lock_table(&a, TABLE, LockMode::IX)?;
    for heap in 2..40u16 {
        let page = PageId(u64::from(heap % 5));
        sys.lock_record(&a, TypeMode::new(LockMode::X), clustered(), page, HeapNo(heap))?;
    }
    assert!(sys.table_has_locks(TABLE));
    assert!(sys.number_of_rows_locked(&a) >= 38);
    sys.resize(128);
    assert_eq!(sys.n_cells(), 128);
    sys.validate()?;
    sys.release_all(&a);
    assert_eq!(a.n_locks(), 0);
    assert!(!sys.table_has_locks(TABLE));
    let snap = sys.snapshot();
    assert!(snap.record_locks.is_empty());
    assert!(snap.table_locks.is_empty());
    assert_eq!(
        metrics
            .hash_resizes
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    Ok(())
}

#[test]
fn explicit_x_lock_is_reported() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    sys.lock_record(&a, TypeMode::rec_not_gap(LockMode::X), clustered(), PAGE, HeapNo(3))?;
    assert!(sys.trx_has_expl_x_lock(&a, PAGE, HeapNo(3)));
    assert!(!sys.trx_has_expl_x_lock(&a, PAGE, HeapNo(4)));
    assert!(sys.unlock_record(&a, PAGE, HeapNo(3), LockMode::X));
    assert!(!sys.unlock_record(&a, PAGE, HeapNo(3), LockMode::X));
    Ok(())
}
