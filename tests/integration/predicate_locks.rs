//! Spatial predicate and R-tree page locks
//!
//! Covers insert checks against searched rectangles, page locks, and the
//! propagation of predicate locks through R-tree splits.

#![allow(missing_docs)]

use std::sync::{Arc, Once};

use lockmgr::lock::{
    HashKind, IsolationLevel, LockMode, LockStatus, LockSys, LockSysOptions, Mbr, Prdt,
    PrdtLockKind, PrdtOp, Trx,
};
use lockmgr::types::{IndexId, IndexRef, LockError, PageId, Result, TableId, TrxId};

const LEAF: PageId = PageId(40);
const SIBLING: PageId = PageId(41);
const PARENT: PageId = PageId(42);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn setup() -> LockSys {
    init_tracing();
    LockSys::new(LockSysOptions::new().n_cells(16))
}

fn trx(id: u64) -> Arc<Trx> {
    Trx::new(TrxId(id), IsolationLevel::Serializable)
}

fn spatial() -> IndexRef {
    IndexRef::secondary(TableId(4), IndexId(2))
}

fn search(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Prdt {
    Prdt::new(Mbr::new(xmin, ymin, xmax, ymax), PrdtOp::Intersect)
}

/// Locks `area` in S mode, as a spatial search does.
fn share(sys: &LockSys, t: &Arc<Trx>, page: PageId, area: Prdt) -> Result<LockStatus> {
    sys.prdt_lock(t, spatial(), page, &area, LockMode::S, PrdtLockKind::Predicate)
}

/// Checks the insert of a unit square at `(x, y)`.
fn insert_point(sys: &LockSys, t: &Arc<Trx>, page: PageId, x: f64, y: f64) -> Result<LockStatus> {
    sys.prdt_insert_check_and_lock(t, spatial(), page, Mbr::new(x, y, x + 1.0, y + 1.0))
}

fn predicate_locks_on(sys: &LockSys, page: PageId) -> usize {
    sys.snapshot()
        .record_locks
        .iter()
        .filter(|l| l.kind == HashKind::Predicate && l.page == page)
        .count()
}

#[test]
fn insert_waits_only_inside_the_searched_rectangle() -> Result<()> {
    let sys = setup();
    let searcher = trx(1);
    let inserter = trx(2);
    let outsider = trx(3);
    let st = sys.prdt_lock(
        &searcher,
        spatial(),
        LEAF,
        &search(0.0, 0.0, 10.0, 10.0),
        LockMode::S,
        PrdtLockKind::Predicate,
    )?;
    assert_eq!(st, LockStatus::GrantedNewLock);

    let st = insert_point(&sys, &outsider, LEAF, 20.0, 20.0)?;
    assert_eq!(st, LockStatus::Granted);
    let st = insert_point(&sys, &inserter, LEAF, 5.0, 5.0)?;
    assert_eq!(st, LockStatus::MustWait);
    sys.validate()?;

    sys.release_all(&searcher);
    assert!(!inserter.is_waiting());
    sys.lock_wait(&inserter)?;
    Ok(())
}

#[test]
fn searches_never_block_each_other() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    let area = search(0.0, 0.0, 4.0, 4.0);
    sys.prdt_lock(&a, spatial(), LEAF, &area, LockMode::S, PrdtLockKind::Predicate)?;
    let st = sys.prdt_lock(&b, spatial(), LEAF, &area, LockMode::X, PrdtLockKind::Predicate)?;
    assert!(st.is_granted());
    // Repeating a covered search adds nothing.
    let st = sys.prdt_lock(&a, spatial(), LEAF, &area, LockMode::S, PrdtLockKind::Predicate)?;
    assert_eq!(st, LockStatus::Granted);
    assert_eq!(predicate_locks_on(&sys, LEAF), 2);
    Ok(())
}

#[test]
fn page_lock_excludes_other_writers() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    assert_eq!(sys.place_prdt_page_lock(&a, spatial(), LEAF)?, LockStatus::GrantedNewLock);
    assert_eq!(sys.place_prdt_page_lock(&a, spatial(), LEAF)?, LockStatus::Granted);
    assert!(sys.test_prdt_page_lock(&a, LEAF));
    assert!(!sys.test_prdt_page_lock(&b, LEAF));
    assert!(sys.test_prdt_page_lock(&b, SIBLING));

    let whole = search(0.0, 0.0, 0.0, 0.0);
    let st = sys.prdt_lock(&b, spatial(), LEAF, &whole, LockMode::X, PrdtLockKind::Page)?;
    assert_eq!(st, LockStatus::MustWait);
    sys.release_all(&a);
    sys.lock_wait(&b)?;
    assert!(sys.test_prdt_page_lock(&b, LEAF));
    Ok(())
}

#[test]
fn split_copies_overlapping_predicates_only() -> Result<()> {
    let sys = setup();
    let near = trx(1);
    let far = trx(2);
    share(&sys, &near, LEAF, search(0.0, 0.0, 10.0, 10.0))?;
    share(&sys, &far, LEAF, search(90.0, 90.0, 95.0, 95.0))?;
    sys.place_prdt_page_lock(&far, spatial(), LEAF)?;

    sys.prdt_update_split(SIBLING, &search(5.0, 5.0, 15.0, 15.0), LEAF);
    assert_eq!(predicate_locks_on(&sys, SIBLING), 1);
    assert!(sys.test_prdt_page_lock(&far, SIBLING));

    let inserter = trx(3);
    let st = insert_point(&sys, &inserter, SIBLING, 6.0, 6.0)?;
    assert_eq!(st, LockStatus::MustWait);
    Ok(())
}

#[test]
fn parent_locks_follow_overlapping_children() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    share(&sys, &a, PARENT, search(0.0, 0.0, 10.0, 10.0))?;
    sys.prdt_update_parent(
        LEAF,
        SIBLING,
        &search(0.0, 0.0, 5.0, 5.0),
        &search(50.0, 50.0, 60.0, 60.0),
        PARENT,
    );
    assert_eq!(predicate_locks_on(&sys, LEAF), 1);
    assert_eq!(predicate_locks_on(&sys, SIBLING), 0);
    Ok(())
}

#[test]
fn moved_predicates_keep_their_waiters() -> Result<()> {
    let sys = setup();
    let searcher = trx(1);
    let inserter = trx(2);
    share(&sys, &searcher, LEAF, search(0.0, 0.0, 10.0, 10.0))?;
    insert_point(&sys, &inserter, LEAF, 1.0, 1.0)?;

    sys.prdt_rec_move(SIBLING, LEAF);
    assert_eq!(predicate_locks_on(&sys, LEAF), 0);
    assert_eq!(predicate_locks_on(&sys, SIBLING), 2);
    assert!(inserter.is_waiting());
    sys.validate()?;

    sys.release_all(&searcher);
    sys.lock_wait(&inserter)?;
    Ok(())
}

#[test]
fn discarded_rtree_page_releases_its_waiters() -> Result<()> {
    let sys = setup();
    let searcher = trx(1);
    let inserter = trx(2);
    share(&sys, &searcher, LEAF, search(0.0, 0.0, 10.0, 10.0))?;
    sys.place_prdt_page_lock(&searcher, spatial(), LEAF)?;
    insert_point(&sys, &inserter, LEAF, 1.0, 1.0)?;

    sys.prdt_page_free_from_discard(LEAF, true);
    sys.lock_wait(&inserter)?;
    assert_eq!(searcher.n_locks(), 0);
    assert!(sys.snapshot().record_locks.is_empty());
    Ok(())
}

#[test]
fn malformed_requests_are_rejected() {
    let sys = setup();
    let a = trx(1);
    let insert_shape = Prdt::for_insert(Mbr::new(0.0, 0.0, 1.0, 1.0));
    assert!(matches!(
        sys.prdt_lock(&a, spatial(), LEAF, &insert_shape, LockMode::S, PrdtLockKind::Predicate),
        Err(LockError::Invalid(_))
    ));
    assert!(matches!(
        sys.prdt_lock(
            &a,
            spatial(),
            LEAF,
            &search(0.0, 0.0, 1.0, 1.0),
            LockMode::IX,
            PrdtLockKind::Predicate
        ),
        Err(LockError::Invalid(_))
    ));
    assert_eq!(a.n_locks(), 0);
}
