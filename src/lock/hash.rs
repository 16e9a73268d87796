//! Lock hash table: cells keyed by page, grouped under shared latches.
//!
//! Every cell holds one chain of record locks in insertion order. Several
//! pages may hash to the same cell, so chain walks always filter by page.
//! Within one page, granted locks precede waiting ones.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use smallvec::SmallVec;

use super::object::{HashKind, RecLock};
use crate::primitives::latch::{Latch, LatchGuard, LatchKind, Latched, SysLatch};
use crate::types::{HeapNo, LockId, PageId};

/// Number of consecutive cells protected by one latch.
pub(crate) const CELLS_PER_LATCH: usize = 7;

/// Locks hashed to one cell.
#[derive(Default, Debug)]
pub(crate) struct LockChain {
    pub(crate) locks: Vec<RecLock>,
}

impl LockChain {
    /// Locks on `page` in chain order.
    pub(crate) fn iter_page(&self, page: PageId) -> impl Iterator<Item = &RecLock> + '_ {
        self.locks.iter().filter(move |l| l.page == page)
    }

    /// Locks on `page` with the bit for `heap` set.
    pub(crate) fn iter_heap(
        &self,
        page: PageId,
        heap: HeapNo,
    ) -> impl Iterator<Item = &RecLock> + '_ {
        self.iter_page(page).filter(move |l| l.has_bit(heap))
    }

    pub(crate) fn first_on_page(&self, page: PageId) -> Option<&RecLock> {
        self.iter_page(page).next()
    }

    pub(crate) fn has_page(&self, page: PageId) -> bool {
        self.first_on_page(page).is_some()
    }

    pub(crate) fn position(&self, id: LockId) -> Option<usize> {
        self.locks.iter().position(|l| l.id == id)
    }

    pub(crate) fn get(&self, id: LockId) -> Option<&RecLock> {
        self.locks.iter().find(|l| l.id == id)
    }

    fn first_waiting_before(&self, page: PageId, end: usize) -> Option<usize> {
        self.locks[..end]
            .iter()
            .position(|l| l.page == page && l.is_waiting())
    }

    /// Appends a waiting lock, or places a granted one ahead of the first
    /// waiter on its page. Returns the position.
    pub(crate) fn insert(&mut self, lock: RecLock) -> usize {
        if !lock.is_waiting() {
            if let Some(at) = self.first_waiting_before(lock.page, self.locks.len()) {
                self.locks.insert(at, lock);
                return at;
            }
        }
        self.locks.push(lock);
        self.locks.len() - 1
    }

    /// Removes the lock at `pos`, preserving the order of the rest.
    pub(crate) fn remove(&mut self, pos: usize) -> RecLock {
        self.locks.remove(pos)
    }

    /// Moves a lock that was just granted ahead of any earlier waiter on its
    /// page. Entries after `pos` keep their positions.
    pub(crate) fn promote(&mut self, pos: usize) -> usize {
        let page = self.locks[pos].page;
        match self.first_waiting_before(page, pos) {
            Some(at) => {
                let lock = self.locks.remove(pos);
                self.locks.insert(at, lock);
                at
            }
            None => pos,
        }
    }

    /// Removes and returns every lock on `page`, in chain order.
    pub(crate) fn drain_page(&mut self, page: PageId) -> Vec<RecLock> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.locks)
            .into_iter()
            .partition(|l| l.page == page);
        self.locks = kept;
        taken
    }
}

type Cells = Box<[LockChain]>;

/// One lock hash table.
pub(crate) struct LockHash<L: Latch> {
    groups: Box<[Latched<L, Cells>]>,
    n_cells: usize,
}

fn new_groups<L: Latch>(
    n_cells: usize,
    make_latch: &mut impl FnMut() -> L,
) -> Box<[Latched<L, Cells>]> {
    let n_groups = n_cells.div_ceil(CELLS_PER_LATCH);
    (0..n_groups)
        .map(|g| {
            let width = CELLS_PER_LATCH.min(n_cells - g * CELLS_PER_LATCH);
            let cells: Cells = (0..width).map(|_| LockChain::default()).collect();
            Latched::from_raw(make_latch(), cells)
        })
        .collect()
}

impl<L: Latch> LockHash<L> {
    pub(crate) fn new(n_cells: usize, mut make_latch: impl FnMut() -> L) -> Self {
        let n_cells = n_cells.max(1);
        Self {
            groups: new_groups(n_cells, &mut make_latch),
            n_cells,
        }
    }

    pub(crate) fn n_cells(&self) -> usize {
        self.n_cells
    }

    fn cell_of(&self, page: PageId) -> usize {
        let mut hasher = FxHasher::default();
        page.hash(&mut hasher);
        (hasher.finish() % self.n_cells as u64) as usize
    }

    /// Latches the cell of one page.
    pub(crate) fn latch(&self, page: PageId) -> CellsGuard<'_, L> {
        self.latch_pages(&[page])
    }

    /// Latches the cells of several pages in ascending group order.
    pub(crate) fn latch_pages(&self, pages: &[PageId]) -> CellsGuard<'_, L> {
        let mut groups: SmallVec<[usize; 4]> = pages
            .iter()
            .map(|&p| self.cell_of(p) / CELLS_PER_LATCH)
            .collect();
        groups.sort_unstable();
        groups.dedup();
        self.latch_groups(groups)
    }

    /// Latches every cell of the table.
    pub(crate) fn latch_all(&self) -> CellsGuard<'_, L> {
        self.latch_groups((0..self.groups.len()).collect())
    }

    fn latch_groups(&self, groups: SmallVec<[usize; 4]>) -> CellsGuard<'_, L> {
        let held = groups
            .into_iter()
            .map(|g| (g, self.groups[g].lock()))
            .collect();
        CellsGuard { hash: self, held }
    }

    /// Rehashes every chain into `n_cells` cells. Relative order of locks
    /// on the same page is preserved.
    pub(crate) fn resize(&mut self, n_cells: usize, mut make_latch: impl FnMut() -> L) {
        let n_cells = n_cells.max(1);
        let old = std::mem::replace(&mut self.groups, new_groups(n_cells, &mut make_latch));
        self.n_cells = n_cells;
        for group in old.into_vec() {
            for chain in group.into_inner().into_vec() {
                for lock in chain.locks {
                    let cell = self.cell_of(lock.page);
                    let cells = self.groups[cell / CELLS_PER_LATCH].get_mut();
                    cells[cell % CELLS_PER_LATCH].locks.push(lock);
                }
            }
        }
    }
}

/// Latches held on a set of cell groups.
pub(crate) struct CellsGuard<'a, L: Latch> {
    hash: &'a LockHash<L>,
    held: SmallVec<[(usize, LatchGuard<'a, L, Cells>); 2]>,
}

impl<L: Latch> CellsGuard<'_, L> {
    /// The chain holding `page`.
    ///
    /// # Panics
    ///
    /// Panics if the page's cell group was not latched by this guard.
    pub(crate) fn chain(&mut self, page: PageId) -> &mut LockChain {
        let cell = self.hash.cell_of(page);
        let group = cell / CELLS_PER_LATCH;
        match self.held.binary_search_by_key(&group, |(g, _)| *g) {
            Ok(slot) => &mut self.held[slot].1[cell % CELLS_PER_LATCH],
            Err(_) => panic!("cell of page {page} is not latched"),
        }
    }

    /// Every latched chain.
    pub(crate) fn chains(&self) -> impl Iterator<Item = &LockChain> + '_ {
        self.held.iter().flat_map(|(_, cells)| cells.iter())
    }
}

/// The record, predicate and page lock tables.
pub(crate) struct LockHashes {
    pub(crate) rec: LockHash<SysLatch>,
    pub(crate) prdt: LockHash<SysLatch>,
    pub(crate) prdt_page: LockHash<SysLatch>,
}

impl LockHashes {
    pub(crate) fn new(n_cells: usize, latch: LatchKind) -> Self {
        Self {
            rec: LockHash::new(n_cells, || latch.new_latch()),
            prdt: LockHash::new(n_cells, || latch.new_latch()),
            prdt_page: LockHash::new(n_cells, || latch.new_latch()),
        }
    }

    pub(crate) fn get(&self, kind: HashKind) -> &LockHash<SysLatch> {
        match kind {
            HashKind::Record => &self.rec,
            HashKind::Predicate => &self.prdt,
            HashKind::PrdtPage => &self.prdt_page,
        }
    }

    pub(crate) fn resize(&mut self, n_cells: usize, latch: LatchKind) {
        self.rec.resize(n_cells, || latch.new_latch());
        self.prdt.resize(n_cells, || latch.new_latch());
        self.prdt_page.resize(n_cells, || latch.new_latch());
    }
}
