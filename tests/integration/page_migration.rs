//! Lock migration across B-tree page mutations
//!
//! Each test drives the hooks in the order a B-tree would call them and
//! checks that the protected gaps and records stay protected afterwards.

#![allow(missing_docs)]

use std::sync::{Arc, Once};

use lockmgr::lock::{IsolationLevel, LockMode, LockStatus, LockSys, LockSysOptions, Trx, TypeMode};
use lockmgr::types::{HeapNo, IndexId, IndexRef, PageId, Result, TableId, TrxId};

const LEFT: PageId = PageId(100);
const RIGHT: PageId = PageId(101);
const HEIR: PageId = PageId(102);

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
    Trx::new(TrxId(id), IsolationLevel::RepeatableRead)
}

fn index() -> IndexRef {
    IndexRef::clustered(TableId(9), IndexId(1))
}

fn heaps_of(sys: &LockSys, t: &Trx, page: PageId) -> Vec<u16> {
    let mut heaps: Vec<u16> = sys
        .snapshot()
        .record_locks_of(t.id())
        .filter(|l| l.page == page)
        .flat_map(|l| l.heaps.iter().map(|h| h.0).collect::<Vec<_>>())
        .collect();
    heaps.sort_unstable();
    heaps
}

#[test]
fn split_right_keeps_both_halves_protected() -> Result<()> {
    let sys = setup();
    let scanner = trx(1);
    let owner = trx(2);
    sys.lock_record(&scanner, TypeMode::new(LockMode::S), index(), LEFT, HeapNo::SUPREMUM)?;
    sys.lock_record(&owner, TypeMode::rec_not_gap(LockMode::X), index(), LEFT, HeapNo(5))?;

    sys.move_rec_list(RIGHT, LEFT, &[(HeapNo(5), HeapNo(2))]);
    sys.update_split_right(RIGHT, LEFT, HeapNo(2));

    assert!(sys.trx_has_expl_x_lock(&owner, RIGHT, HeapNo(2)));
    assert_eq!(heaps_of(&sys, &scanner, RIGHT), vec![1]);
    assert!(heaps_of(&sys, &scanner, LEFT).is_empty());

    // The end of the right page is still covered by the scanner.
    let late = trx(3);
    let ins = sys.insert_check_and_lock(&late, index(), RIGHT, HeapNo::SUPREMUM)?;
    assert_eq!(ins.status, LockStatus::MustWait);
    // The gap before the moved record now ends at the left supremum.
    let early = trx(4);
    let ins = sys.insert_check_and_lock(&early, index(), LEFT, HeapNo::SUPREMUM)?;
    assert_eq!(ins.status, LockStatus::MustWait);
    sys.validate()?;
    Ok(())
}

#[test]
fn merge_left_carries_waiters_along() -> Result<()> {
    let sys = setup();
    let scanner = trx(1);
    let inserter = trx(2);
    sys.lock_record(&scanner, TypeMode::new(LockMode::S), index(), RIGHT, HeapNo::SUPREMUM)?;
    let ins = sys.insert_check_and_lock(&inserter, index(), RIGHT, HeapNo::SUPREMUM)?;
    assert_eq!(ins.status, LockStatus::MustWait);

    sys.update_merge_left(LEFT, Some(HeapNo(7)), RIGHT);
    assert!(inserter.is_waiting());
    assert_eq!(heaps_of(&sys, &scanner, LEFT), vec![1]);
    assert!(heaps_of(&sys, &scanner, RIGHT).is_empty());
    sys.validate()?;

    sys.release_all(&scanner);
    assert!(!inserter.is_waiting());
    sys.lock_wait(&inserter)?;
    Ok(())
}

#[test]
fn merge_right_inherits_left_supremum_and_frees_left() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    sys.lock_record(&a, TypeMode::new(LockMode::X), index(), LEFT, HeapNo::SUPREMUM)?;
    sys.lock_record(&a, TypeMode::new(LockMode::X), index(), LEFT, HeapNo(3))?;
    sys.update_merge_right(RIGHT, HeapNo(2), LEFT);
    assert!(heaps_of(&sys, &a, LEFT).is_empty());
    assert_eq!(heaps_of(&sys, &a, RIGHT), vec![2]);
    let snap = sys.snapshot();
    assert!(snap.record_locks[0].type_mode.contains("locks gap before rec"));
    Ok(())
}

#[test]
fn discarded_page_hands_gaps_to_heir_and_cancels_waiters() -> Result<()> {
    let sys = setup();
    let reader = trx(1);
    let writer = trx(2);
    sys.lock_record(&reader, TypeMode::new(LockMode::S), index(), LEFT, HeapNo(3))?;
    assert_eq!(
        sys.lock_record(&writer, TypeMode::new(LockMode::X), index(), LEFT, HeapNo(3))?,
        LockStatus::MustWait
    );

    sys.update_discard(HEIR, HeapNo(2), LEFT, &[HeapNo(3)]);

    // The cancelled waiter wakes without error and retries elsewhere.
    sys.lock_wait(&writer)?;
    assert!(!writer.is_waiting());
    assert_eq!(heaps_of(&sys, &reader, HEIR), vec![2]);
    assert!(sys.snapshot().record_locks.iter().all(|l| l.page != LEFT));
    assert!(sys
        .snapshot()
        .record_locks
        .iter()
        .all(|l| l.type_mode.contains("locks gap before rec")));
    sys.validate()?;
    Ok(())
}

#[test]
fn reorganize_renumbers_heaps() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    sys.lock_record(&a, TypeMode::new(LockMode::X), index(), LEFT, HeapNo(3))?;
    sys.lock_record(&a, TypeMode::new(LockMode::X), index(), LEFT, HeapNo(4))?;
    sys.lock_record(&b, TypeMode::new(LockMode::S), index(), LEFT, HeapNo(4))?;
    sys.move_reorganize_page(LEFT, &[(HeapNo(3), HeapNo(5)), (HeapNo(4), HeapNo(6))]);

    assert_eq!(heaps_of(&sys, &a, LEFT), vec![5, 6]);
    assert!(b.is_waiting());
    assert_eq!(heaps_of(&sys, &b, LEFT), vec![6]);
    sys.validate()?;
    sys.release_all(&a);
    assert!(!b.is_waiting());
    Ok(())
}

#[test]
fn in_place_update_round_trips_through_infimum() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    sys.lock_record(&a, TypeMode::rec_not_gap(LockMode::X), index(), LEFT, HeapNo(4))?;
    sys.store_on_page_infimum(LEFT, HeapNo(4));
    assert_eq!(heaps_of(&sys, &a, LEFT), vec![0]);
    sys.restore_from_page_infimum(LEFT, HeapNo(9), LEFT);
    assert_eq!(heaps_of(&sys, &a, LEFT), vec![9]);
    assert!(sys.trx_has_expl_x_lock(&a, LEFT, HeapNo(9)));
    Ok(())
}

#[test]
fn inserted_record_inherits_only_gap_covering_locks() -> Result<()> {
    let sys = setup();
    let next_key = trx(1);
    let rec_only = trx(2);
    sys.lock_record(&next_key, TypeMode::new(LockMode::S), index(), LEFT, HeapNo(5))?;
    sys.lock_record(&rec_only, TypeMode::rec_not_gap(LockMode::S), index(), LEFT, HeapNo(5))?;

    sys.update_insert(LEFT, HeapNo(8), HeapNo(5));
    assert_eq!(heaps_of(&sys, &next_key, LEFT), vec![5, 8]);
    assert_eq!(heaps_of(&sys, &rec_only, LEFT), vec![5]);

    let inserter = trx(3);
    let ins = sys.insert_check_and_lock(&inserter, index(), LEFT, HeapNo(8))?;
    assert_eq!(ins.status, LockStatus::MustWait);
    Ok(())
}

#[test]
fn deleted_record_passes_its_locks_to_successor() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    sys.lock_record(&a, TypeMode::rec_not_gap(LockMode::S), index(), LEFT, HeapNo(4))?;
    sys.update_delete(LEFT, HeapNo(4), HeapNo(6));
    assert_eq!(heaps_of(&sys, &a, LEFT), vec![6]);
    sys.reset_and_inherit_gap_locks(LEFT, HeapNo(6), LEFT, HeapNo(7));
    assert!(heaps_of(&sys, &a, LEFT).is_empty());
    Ok(())
}

#[test]
fn root_raise_and_copy_move_the_supremum() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    sys.lock_record(&a, TypeMode::new(LockMode::S), index(), LEFT, HeapNo::SUPREMUM)?;
    sys.update_root_raise(RIGHT, LEFT);
    assert_eq!(heaps_of(&sys, &a, RIGHT), vec![1]);
    sys.update_copy_and_discard(HEIR, RIGHT);
    assert_eq!(heaps_of(&sys, &a, HEIR), vec![1]);
    assert!(heaps_of(&sys, &a, RIGHT).is_empty());
    Ok(())
}

#[test]
fn split_and_merge_reconnects_the_gap() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    sys.lock_record(&a, TypeMode::new(LockMode::S), index(), LEFT, HeapNo::SUPREMUM)?;
    sys.lock_record(&b, TypeMode::new(LockMode::X), index(), RIGHT, HeapNo(2))?;
    sys.update_split_and_merge(LEFT, HeapNo(6), RIGHT, HeapNo(2));
    assert_eq!(heaps_of(&sys, &a, LEFT), vec![6]);
    assert_eq!(heaps_of(&sys, &b, LEFT), vec![1]);
    sys.validate()?;
    Ok(())
}

#[test]
fn freeing_a_page_wakes_its_waiters() -> Result<()> {
    let sys = setup();
    let a = trx(1);
    let b = trx(2);
    sys.lock_record(&a, TypeMode::new(LockMode::X), index(), LEFT, HeapNo(2))?;
    sys.lock_record(&b, TypeMode::new(LockMode::X), index(), LEFT, HeapNo(2))?;
    sys.free_all_from_discard_page(LEFT);
    sys.lock_wait(&b)?;
    assert_eq!(a.n_locks(), 0);
    assert_eq!(b.n_locks(), 0);
    assert!(sys.snapshot().record_locks.is_empty());
    Ok(())
}
