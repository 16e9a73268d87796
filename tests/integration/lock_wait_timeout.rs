//! Lock wait timeouts, no-wait mode and interrupts
//!
//! A wait that ends in a timeout or interrupt must leave no request behind,
//! so the holder's release does not hand the lock to a session that gave up.

#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use lockmgr::lock::{
    CounterLockMetrics, IsolationLevel, LockMode, LockStatus, LockSys, LockSysOptions, Trx,
    TypeMode,
};
use lockmgr::types::{HeapNo, IndexId, IndexRef, LockError, PageId, Result, TableId, TrxId};

const PAGE: PageId = PageId(5);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn trx(id: u64) -> Arc<Trx> {
    Trx::new(TrxId(id), IsolationLevel::RepeatableRead)
}

fn index() -> IndexRef {
    IndexRef::clustered(TableId(2), IndexId(1))
}

#[test]
fn wait_times_out_and_withdraws_the_request() -> Result<()> {
    init_tracing();
    let metrics = Arc::new(CounterLockMetrics::default());
    let timeout = Duration::from_millis(40);
    let sys = LockSys::new(
        LockSysOptions::new()
            .lock_wait_timeout(timeout)
            .metrics(metrics.clone()),
    );
    let a = trx(1);
    let b = trx(2);
    sys.lock_record(&a, TypeMode::new(LockMode::X), index(), PAGE, HeapNo(3))?;
    sys.lock_record(&b, TypeMode::new(LockMode::X), index(), PAGE, HeapNo(3))?;

    let started = Instant::now();
    assert_eq!(sys.lock_wait(&b), Err(LockError::LockWaitTimeout));
    assert!(started.elapsed() >= timeout);
    assert_eq!(b.n_locks(), 0);
    assert!(sys.snapshot().waits.is_empty());
    assert_eq!(metrics.lock_waits.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.lock_wait_timeouts.load(Ordering::Relaxed), 1);

    sys.release_all(&a);
    assert!(sys.snapshot().record_locks.is_empty());
    Ok(())
}

#[test]
fn no_wait_mode_fails_without_enqueueing() -> Result<()> {
    init_tracing();
    let sys = LockSys::new(LockSysOptions::no_wait());
    let a = trx(1);
    let b = trx(2);
    sys.lock_record(&a, TypeMode::rec_not_gap(LockMode::X), index(), PAGE, HeapNo(3))?;
    assert_eq!(
        sys.lock_record(&b, TypeMode::rec_not_gap(LockMode::S), index(), PAGE, HeapNo(3)),
        Err(LockError::LockWaitTimeout)
    );
    sys.lock_table(&a, TableId(2), LockMode::X)?;
    assert_eq!(
        sys.lock_table(&b, TableId(2), LockMode::IS),
        Err(LockError::LockWaitTimeout)
    );
    assert_eq!(b.n_locks(), 0);
    assert!(!b.is_waiting());
    // Compatible requests still succeed.
    assert!(sys
        .lock_record(&b, TypeMode::rec_not_gap(LockMode::S), index(), PAGE, HeapNo(4))?
        .is_granted());
    Ok(())
}

#[test]
fn release_before_deadline_grants_the_waiter() -> Result<()> {
    init_tracing();
    let sys = Arc::new(LockSys::new(
        LockSysOptions::new().lock_wait_timeout(Duration::from_secs(10)),
    ));
    let a = trx(1);
    let b = trx(2);
    sys.lock_record(&a, TypeMode::new(LockMode::X), index(), PAGE, HeapNo(3))?;
    assert_eq!(
        sys.lock_record(&b, TypeMode::new(LockMode::X), index(), PAGE, HeapNo(3))?,
        LockStatus::MustWait
    );
    let releaser = {
        let sys = Arc::clone(&sys);
        let a = Arc::clone(&a);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sys.release_all(&a);
        })
    };
    let started = Instant::now();
    sys.lock_wait(&b)?;
    assert!(started.elapsed() < Duration::from_secs(10));
    releaser.join().expect("releaser thread");
    assert!(sys.trx_has_expl_x_lock(&b, PAGE, HeapNo(3)));
    Ok(())
}

#[test]
fn interrupted_waiter_leaves_queue_clean() -> Result<()> {
    init_tracing();
    let sys = Arc::new(LockSys::new(LockSysOptions::new()));
    let a = trx(1);
    let b = trx(2);
    let c = trx(3);
    sys.lock_record(&a, TypeMode::new(LockMode::X), index(), PAGE, HeapNo(3))?;
    sys.lock_record(&b, TypeMode::new(LockMode::X), index(), PAGE, HeapNo(3))?;
    sys.lock_record(&c, TypeMode::new(LockMode::S), index(), PAGE, HeapNo(3))?;

    let waiter = {
        let sys = Arc::clone(&sys);
        let b = Arc::clone(&b);
        thread::spawn(move || sys.lock_wait(&b))
    };
    thread::sleep(Duration::from_millis(10));
    assert!(sys.cancel(&b));
    assert_eq!(waiter.join().expect("waiter thread"), Err(LockError::Interrupted));

    sys.release_all(&a);
    assert!(!c.is_waiting());
    assert_eq!(b.n_locks(), 0);
    sys.validate()?;
    Ok(())
}

#[test]
fn table_wait_timeout_releases_autoinc() -> Result<()> {
    init_tracing();
    let sys = LockSys::new(LockSysOptions::new().lock_wait_timeout(Duration::from_millis(20)));
    let a = trx(1);
    let b = trx(2);
    let other = trx(3);
    let t1 = TableId(1);
    let t2 = TableId(2);
    sys.lock_table(&a, t1, LockMode::AutoInc)?;
    sys.lock_table(&other, t2, LockMode::X)?;
    assert_eq!(sys.lock_table(&b, t1, LockMode::AutoInc)?, LockStatus::MustWait);
    assert_eq!(sys.lock_table(&a, t2, LockMode::IX)?, LockStatus::MustWait);

    assert_eq!(sys.lock_wait(&a), Err(LockError::LockWaitTimeout));
    assert_eq!(sys.autoinc_holder(t1), Some(TrxId(2)));
    sys.lock_wait(&b)?;
    sys.validate()?;
    Ok(())
}
