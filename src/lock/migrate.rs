//! Lock migration hooks for B-tree page mutations.
//!
//! When records move between pages or heap slots, their locks move with
//! them; when a record disappears, the gap it bounded merges into the
//! successor's gap, so locks on it are inherited as gap locks. Every hook
//! latches the cells of all pages it touches, in all three hash tables,
//! for its whole duration.

use std::sync::Arc;

use tracing::debug;

use super::hash::{CellsGuard, LockChain, LockHashes};
use super::mode::{LockMode, TypeMode};
use super::object::RecLock;
use super::prdt::Prdt;
use super::record::RecRequest;
use super::trx::{IsolationLevel, Trx};
use super::LockSys;
use crate::primitives::latch::SysLatch;
use crate::types::{HeapNo, IndexRef, PageId};

/// One heap's share of a lock, taken off its old position.
pub(crate) struct Detached {
    pub(crate) trx: Arc<Trx>,
    pub(crate) index: IndexRef,
    pub(crate) type_mode: TypeMode,
    pub(crate) prdt: Option<Prdt>,
}

/// Clears `heap` from every lock on `page` and returns what was cleared, in
/// chain order. Locks left without bits are removed; their owners forget
/// them but keep their pending wait, which the caller re-creates elsewhere.
pub(crate) fn strip(chain: &mut LockChain, page: PageId, heap: HeapNo) -> Vec<Detached> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < chain.locks.len() {
        let lock = &mut chain.locks[pos];
        if lock.page == page && lock.bits.clear(heap) {
            out.push(Detached {
                trx: Arc::clone(&lock.trx),
                index: lock.index,
                type_mode: lock.type_mode,
                prdt: lock.prdt,
            });
            if lock.bits.is_empty() {
                let lock = chain.remove(pos);
                lock.trx.lock.lock().locks.retain(|r| r.id() != lock.id);
                continue;
            }
        }
        pos += 1;
    }
    out
}

/// Whether a lock passes to the gap before the successor when its record
/// goes away.
fn inherits(lock: &RecLock) -> bool {
    if lock.type_mode.is_insert_intention() {
        return false;
    }
    let trx = &lock.trx;
    let statement_mode = if trx.duplicates() {
        LockMode::S
    } else {
        LockMode::X
    };
    trx.isolation() > IsolationLevel::ReadCommitted || lock.mode() != statement_mode
}

/// Cell latches of a set of pages in all three hash tables.
struct PageLatches<'a> {
    rec: CellsGuard<'a, SysLatch>,
    prdt: CellsGuard<'a, SysLatch>,
    prdt_page: CellsGuard<'a, SysLatch>,
}

impl<'a> PageLatches<'a> {
    fn new(hashes: &'a LockHashes, pages: &[PageId]) -> Self {
        Self {
            rec: hashes.rec.latch_pages(pages),
            prdt: hashes.prdt.latch_pages(pages),
            prdt_page: hashes.prdt_page.latch_pages(pages),
        }
    }
}

impl LockSys {
    /// Moves every lock on `(donor, donor_heap)` to `(receiver,
    /// receiver_heap)`. Waiting locks stay waiting.
    fn rec_move(
        &self,
        l: &mut PageLatches<'_>,
        receiver: PageId,
        receiver_heap: HeapNo,
        donor: PageId,
        donor_heap: HeapNo,
    ) {
        let moved = strip(l.rec.chain(donor), donor, donor_heap);
        if moved.is_empty() {
            return;
        }
        let chain = l.rec.chain(receiver);
        for m in moved {
            self.rec_add_to_queue(
                chain,
                &m.trx,
                RecRequest {
                    type_mode: m.type_mode,
                    index: m.index,
                    page: receiver,
                    heap: receiver_heap,
                },
            );
        }
    }

    /// Gives the heir a granted gap lock for every lock on `(page, heap)`,
    /// waiting ones included.
    fn inherit_to_gap(
        &self,
        l: &mut PageLatches<'_>,
        heir_page: PageId,
        heir_heap: HeapNo,
        page: PageId,
        heap: HeapNo,
    ) {
        let inherited: Vec<_> = l
            .rec
            .chain(page)
            .iter_heap(page, heap)
            .filter(|lock| inherits(lock))
            .map(|lock| (Arc::clone(&lock.trx), lock.mode(), lock.index))
            .collect();
        let chain = l.rec.chain(heir_page);
        for (trx, mode, index) in inherited {
            self.rec_add_to_queue(
                chain,
                &trx,
                RecRequest {
                    type_mode: TypeMode::gap(mode),
                    index,
                    page: heir_page,
                    heap: heir_heap,
                },
            );
        }
    }

    /// Like [`Self::inherit_to_gap`] within one page, but only for locks
    /// that cover the gap.
    fn inherit_to_gap_if_gap_lock(
        &self,
        l: &mut PageLatches<'_>,
        page: PageId,
        heir_heap: HeapNo,
        heap: HeapNo,
    ) {
        let chain = l.rec.chain(page);
        let inherited: Vec<_> = chain
            .iter_heap(page, heap)
            .filter(|lock| {
                !lock.type_mode.is_insert_intention()
                    && (heap.is_supremum() || !lock.type_mode.is_rec_not_gap())
                    && !lock
                        .trx
                        .lock
                        .lock()
                        .has_table_lock(lock.index.table, LockMode::X)
            })
            .map(|lock| (Arc::clone(&lock.trx), lock.mode(), lock.index))
            .collect();
        for (trx, mode, index) in inherited {
            self.rec_add_to_queue(
                chain,
                &trx,
                RecRequest {
                    type_mode: TypeMode::gap(mode),
                    index,
                    page,
                    heap: heir_heap,
                },
            );
        }
    }

    /// Cancels waiters on `(page, heap)` and clears the heap from granted
    /// locks. Cancelled waiters wake without error and retry.
    fn reset_and_release_wait(&self, chain: &mut LockChain, page: PageId, heap: HeapNo) {
        let mut pos = 0;
        while pos < chain.locks.len() {
            let lock = &mut chain.locks[pos];
            if lock.page != page || !lock.has_bit(heap) {
                pos += 1;
                continue;
            }
            if lock.is_waiting() {
                self.rec_cancel(chain, pos, None);
                continue;
            }
            lock.bits.clear(heap);
            if lock.bits.is_empty() {
                let lock = chain.remove(pos);
                lock.trx.lock.lock().detach(lock.id, None);
                continue;
            }
            pos += 1;
        }
    }

    /// Resets a record heap and the predicate and page locks of the page.
    fn reset_and_release_wait_all(&self, l: &mut PageLatches<'_>, page: PageId, heap: HeapNo) {
        self.reset_and_release_wait(l.rec.chain(page), page, heap);
        self.reset_and_release_wait(l.prdt.chain(page), page, HeapNo::PRDT);
        self.reset_and_release_wait(l.prdt_page.chain(page), page, HeapNo::PRDT);
    }

    /// Drops removed locks from their owners, waking waiters.
    pub(crate) fn discard(&self, locks: Vec<RecLock>) {
        for lock in locks {
            if lock.is_waiting() {
                self.wake_cancelled(&lock.trx, lock.id, None);
            } else {
                lock.trx.lock.lock().detach(lock.id, None);
            }
        }
    }

    fn free_all(&self, l: &mut PageLatches<'_>, page: PageId) {
        let mut locks = l.rec.chain(page).drain_page(page);
        locks.extend(l.prdt.chain(page).drain_page(page));
        locks.extend(l.prdt_page.chain(page).drain_page(page));
        self.discard(locks);
    }

    /// Re-keys the locks of a reorganized page through `heap_map`, a list of
    /// `(old, new)` heap numbers. The infimum and supremum map to themselves
    /// unless listed. Granted locks are re-added before waiting ones; a
    /// waiter whose record has no new heap is cancelled.
    pub fn move_reorganize_page(&self, page: PageId, heap_map: &[(HeapNo, HeapNo)]) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[page]);
        let chain = l.rec.chain(page);
        let mut old = chain.drain_page(page);
        if old.is_empty() {
            return;
        }
        old.sort_by_key(RecLock::is_waiting);
        let map = |heap: HeapNo| {
            heap_map
                .iter()
                .find(|(from, _)| *from == heap)
                .map(|(_, to)| *to)
                .or_else(|| (heap == HeapNo::INFIMUM || heap.is_supremum()).then_some(heap))
        };
        let n_locks = old.len();
        for lock in old {
            lock.trx.lock.lock().locks.retain(|r| r.id() != lock.id);
            for heap in lock.bits.iter() {
                match map(heap) {
                    Some(new_heap) => {
                        self.rec_add_to_queue(
                            chain,
                            &lock.trx,
                            RecRequest {
                                type_mode: lock.type_mode,
                                index: lock.index,
                                page,
                                heap: new_heap,
                            },
                        );
                    }
                    None if lock.is_waiting() => self.wake_cancelled(&lock.trx, lock.id, None),
                    None => {}
                }
            }
        }
        debug!(page = page.0, n_locks, "lock.migrate.reorganize");
    }

    /// Moves locks of records copied from `page` to `new_page`. `moves`
    /// lists `(old heap, new heap)` pairs; locks are processed one at a time
    /// in chain order.
    pub fn move_rec_list(&self, new_page: PageId, page: PageId, moves: &[(HeapNo, HeapNo)]) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[new_page, page]);
        let ids: Vec<_> = l.rec.chain(page).iter_page(page).map(|lock| lock.id).collect();
        for id in ids {
            for &(old, new) in moves {
                let donor = l.rec.chain(page);
                let Some(pos) = donor.position(id) else {
                    break;
                };
                let lock = &mut donor.locks[pos];
                if !lock.bits.clear(old) {
                    continue;
                }
                let (trx, type_mode, index) = (Arc::clone(&lock.trx), lock.type_mode, lock.index);
                if lock.bits.is_empty() {
                    donor.remove(pos);
                    trx.lock.lock().locks.retain(|r| r.id() != id);
                }
                self.rec_add_to_queue(
                    l.rec.chain(new_page),
                    &trx,
                    RecRequest {
                        type_mode,
                        index,
                        page: new_page,
                        heap: new,
                    },
                );
            }
        }
        debug!(
            new_page = new_page.0,
            page = page.0,
            n_moves = moves.len(),
            "lock.migrate.move_rec_list"
        );
    }

    /// The upper half of `left` moved to the new page `right`, whose first
    /// user record has heap `right_min`.
    pub fn update_split_right(&self, right: PageId, left: PageId, right_min: HeapNo) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[right, left]);
        self.rec_move(&mut l, right, HeapNo::SUPREMUM, left, HeapNo::SUPREMUM);
        self.inherit_to_gap(&mut l, left, HeapNo::SUPREMUM, right, right_min);
        debug!(right = right.0, left = left.0, "lock.migrate.split_right");
    }

    /// The lower half of `right` moved to the new page `left`.
    pub fn update_split_left(&self, right: PageId, left: PageId, right_min: HeapNo) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[right, left]);
        self.inherit_to_gap(&mut l, left, HeapNo::SUPREMUM, right, right_min);
        debug!(right = right.0, left = left.0, "lock.migrate.split_left");
    }

    /// `left` was merged into the start of `right` and will be freed.
    /// `orig_succ` is the heap of the record that was first on `right`.
    pub fn update_merge_right(&self, right: PageId, orig_succ: HeapNo, left: PageId) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[right, left]);
        self.inherit_to_gap(&mut l, right, orig_succ, left, HeapNo::SUPREMUM);
        self.reset_and_release_wait(l.rec.chain(left), left, HeapNo::SUPREMUM);
        self.free_all(&mut l, left);
        debug!(right = right.0, left = left.0, "lock.migrate.merge_right");
    }

    /// `right` was merged onto the end of `left` and will be freed.
    /// `moved_first` is the new heap on `left` of the first moved record, or
    /// `None` when no record moved.
    pub fn update_merge_left(&self, left: PageId, moved_first: Option<HeapNo>, right: PageId) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[left, right]);
        if let Some(first) = moved_first {
            self.inherit_to_gap(&mut l, left, first, left, HeapNo::SUPREMUM);
            self.reset_and_release_wait(l.rec.chain(left), left, HeapNo::SUPREMUM);
        }
        self.rec_move(&mut l, left, HeapNo::SUPREMUM, right, HeapNo::SUPREMUM);
        self.free_all(&mut l, right);
        debug!(left = left.0, right = right.0, "lock.migrate.merge_left");
    }

    /// A split was immediately followed by a merge of `right` into `left`.
    /// `left_next` is the heap of the first moved record on `left`.
    pub fn update_split_and_merge(
        &self,
        left: PageId,
        left_next: HeapNo,
        right: PageId,
        right_min: HeapNo,
    ) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[left, right]);
        self.inherit_to_gap(&mut l, left, left_next, left, HeapNo::SUPREMUM);
        self.reset_and_release_wait_all(&mut l, left, HeapNo::SUPREMUM);
        self.inherit_to_gap(&mut l, left, HeapNo::SUPREMUM, right, right_min);
        debug!(left = left.0, right = right.0, "lock.migrate.split_and_merge");
    }

    /// The root's records moved to `new_page` before the tree grew a level.
    pub fn update_root_raise(&self, new_page: PageId, root: PageId) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[new_page, root]);
        self.rec_move(&mut l, new_page, HeapNo::SUPREMUM, root, HeapNo::SUPREMUM);
        debug!(new_page = new_page.0, root = root.0, "lock.migrate.root_raise");
    }

    /// All records of `page` were copied to `new_page`; `page` is freed.
    pub fn update_copy_and_discard(&self, new_page: PageId, page: PageId) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[new_page, page]);
        self.rec_move(&mut l, new_page, HeapNo::SUPREMUM, page, HeapNo::SUPREMUM);
        self.free_all(&mut l, page);
        debug!(new_page = new_page.0, page = page.0, "lock.migrate.copy_and_discard");
    }

    /// `page` is discarded. Every record's locks are inherited as gap locks
    /// by `(heir_page, heir_heap)`. `user_heaps` lists the page's user
    /// records in key order.
    pub fn update_discard(
        &self,
        heir_page: PageId,
        heir_heap: HeapNo,
        page: PageId,
        user_heaps: &[HeapNo],
    ) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[heir_page, page]);
        if l.rec.chain(page).has_page(page) {
            let heaps = std::iter::once(HeapNo::INFIMUM)
                .chain(user_heaps.iter().copied())
                .chain(std::iter::once(HeapNo::SUPREMUM));
            for heap in heaps {
                self.inherit_to_gap(&mut l, heir_page, heir_heap, page, heap);
                self.reset_and_release_wait(l.rec.chain(page), page, heap);
            }
            let locks = l.rec.chain(page).drain_page(page);
            self.discard(locks);
        } else {
            let mut locks = l.prdt.chain(page).drain_page(page);
            locks.extend(l.prdt_page.chain(page).drain_page(page));
            self.discard(locks);
        }
        debug!(
            heir_page = heir_page.0,
            heir_heap = heir_heap.0,
            page = page.0,
            "lock.migrate.discard"
        );
    }

    /// A record was inserted at `heap` just before `next_heap`; it inherits
    /// the gap locks of its successor.
    pub fn update_insert(&self, page: PageId, heap: HeapNo, next_heap: HeapNo) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[page]);
        self.inherit_to_gap_if_gap_lock(&mut l, page, heap, next_heap);
    }

    /// The record at `heap` is being removed; its successor `next_heap`
    /// inherits its locks as gap locks.
    pub fn update_delete(&self, page: PageId, heap: HeapNo, next_heap: HeapNo) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[page]);
        self.inherit_to_gap(&mut l, page, next_heap, page, heap);
        self.reset_and_release_wait_all(&mut l, page, heap);
    }

    /// Resets the locks on the heir, then gives it gap locks inherited from
    /// `(page, heap)`.
    pub fn reset_and_inherit_gap_locks(
        &self,
        heir_page: PageId,
        heir_heap: HeapNo,
        page: PageId,
        heap: HeapNo,
    ) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[heir_page, page]);
        self.reset_and_release_wait_all(&mut l, heir_page, heir_heap);
        self.inherit_to_gap(&mut l, heir_page, heir_heap, page, heap);
    }

    /// Parks the locks of a record about to be updated in place on the
    /// page infimum.
    pub fn store_on_page_infimum(&self, page: PageId, heap: HeapNo) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[page]);
        self.rec_move(&mut l, page, HeapNo::INFIMUM, page, heap);
    }

    /// Moves locks parked on the infimum of `donor` to the updated record.
    pub fn restore_from_page_infimum(&self, page: PageId, heap: HeapNo, donor: PageId) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[page, donor]);
        self.rec_move(&mut l, page, heap, donor, HeapNo::INFIMUM);
    }

    /// Removes every record, predicate and page lock of a freed page.
    pub fn free_all_from_discard_page(&self, page: PageId) {
        let hashes = self.hashes.read();
        let mut l = PageLatches::new(&hashes, &[page]);
        self.free_all(&mut l, page);
        debug!(page = page.0, "lock.migrate.free_all");
    }
}
