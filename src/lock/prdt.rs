//! Spatial predicate locks and R-tree page locks.
//!
//! Predicate locks live in their own hash table on the reserved heap
//! [`HeapNo::PRDT`] of an index page and carry the bounding rectangle of the
//! search that took them. Only inserts wait for predicate locks, and only
//! when the inserted rectangle is consistent with the locked predicate.
//! Page locks keep an R-tree page from being shrunk or merged under a
//! running scan.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::conflict::prdt_has_to_wait;
use super::hash::LockChain;
use super::mode::{flags, LockMode, TypeMode};
use super::object::HashKind;
use super::record::RecRequest;
use super::trx::Trx;
use super::{LockStatus, LockSys};
use crate::types::{HeapNo, IndexRef, LockError, LockId, PageId, Result, TrxId};

/// Minimum bounding rectangle.
#[derive(Copy, Clone, PartialEq, Debug, Serialize)]
pub struct Mbr {
    /// Lower x bound.
    pub xmin: f64,
    /// Lower y bound.
    pub ymin: f64,
    /// Upper x bound.
    pub xmax: f64,
    /// Upper y bound.
    pub ymax: f64,
}

impl Mbr {
    /// Creates a rectangle from its corners.
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Whether `other` lies inside `self`, borders included.
    pub fn contains(&self, other: &Mbr) -> bool {
        other.xmin >= self.xmin
            && other.xmax <= self.xmax
            && other.ymin >= self.ymin
            && other.ymax <= self.ymax
    }

    /// Whether `self` lies inside `other`.
    pub fn within(&self, other: &Mbr) -> bool {
        other.contains(self)
    }

    /// Whether the rectangles share at least one point.
    pub fn intersects(&self, other: &Mbr) -> bool {
        !(other.xmin > self.xmax
            || other.xmax < self.xmin
            || other.ymin > self.ymax
            || other.ymax < self.ymin)
    }

    /// Whether the rectangles share no point.
    pub fn disjoint(&self, other: &Mbr) -> bool {
        !self.intersects(other)
    }

    /// Whether all four coordinates are equal.
    pub fn equals(&self, other: &Mbr) -> bool {
        self.xmin == other.xmin
            && self.ymin == other.ymin
            && self.xmax == other.xmax
            && self.ymax == other.ymax
    }

    /// Grows `self` to cover `other` as well.
    pub fn enlarge(&mut self, other: &Mbr) {
        self.xmin = self.xmin.min(other.xmin);
        self.ymin = self.ymin.min(other.ymin);
        self.xmax = self.xmax.max(other.xmax);
        self.ymax = self.ymax.max(other.ymax);
    }
}

/// Search operator a predicate was taken for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize)]
pub enum PrdtOp {
    /// The locked rectangle contains the searched one.
    Contain,
    /// The rectangles do not overlap.
    Disjoint,
    /// The rectangles are identical.
    MbrEqual,
    /// The rectangles overlap.
    Intersect,
    /// The locked rectangle lies within the searched one.
    Within,
}

/// A predicate: rectangle plus search operator.
///
/// Inserts carry no operator; the operator of the lock they are checked
/// against is used instead.
#[derive(Copy, Clone, PartialEq, Debug, Serialize)]
pub struct Prdt {
    /// Bounding rectangle.
    pub mbr: Mbr,
    /// Search operator, `None` for inserts.
    pub op: Option<PrdtOp>,
}

impl Prdt {
    /// Predicate of a search.
    pub fn new(mbr: Mbr, op: PrdtOp) -> Self {
        Self { mbr, op: Some(op) }
    }

    /// Predicate of an inserted entry.
    pub fn for_insert(mbr: Mbr) -> Self {
        Self { mbr, op: None }
    }
}

/// Evaluates `op` between a locked predicate `p1` and a requested one `p2`.
///
/// With `op` unset, the operator of `p1` is used, and predicates taken for
/// different operators are never consistent.
pub fn prdt_consistent(p1: &Prdt, p2: &Prdt, op: Option<PrdtOp>) -> bool {
    let action = match op {
        Some(op) => Some(op),
        None => {
            if p2.op.is_some() && p1.op != p2.op {
                return false;
            }
            p1.op
        }
    };
    let (a, b) = (&p1.mbr, &p2.mbr);
    match action {
        Some(PrdtOp::Contain) => a.contains(b),
        Some(PrdtOp::Disjoint) => a.disjoint(b),
        Some(PrdtOp::MbrEqual) => a.equals(b),
        Some(PrdtOp::Intersect) => a.intersects(b),
        Some(PrdtOp::Within) => a.within(b),
        None => false,
    }
}

/// Which of the two spatial lock kinds to take.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PrdtLockKind {
    /// A predicate lock on the searched rectangle.
    Predicate,
    /// A lock on the whole R-tree page.
    Page,
}

impl PrdtLockKind {
    fn flag(self) -> u32 {
        match self {
            PrdtLockKind::Predicate => flags::PREDICATE,
            PrdtLockKind::Page => flags::PRDT_PAGE,
        }
    }
}

/// Finds a lock of `trx` on `page` with exactly `type_mode`, and for
/// predicate locks the same predicate.
pub(crate) fn prdt_find_on_page(
    chain: &LockChain,
    trx: TrxId,
    type_mode: TypeMode,
    page: PageId,
    prdt: Option<&Prdt>,
) -> Option<usize> {
    chain.locks.iter().position(|l| {
        l.page == page
            && l.trx_id() == trx
            && l.type_mode == type_mode
            && (type_mode.is_prdt_page()
                || match (l.prdt.as_ref(), prdt) {
                    (Some(held), Some(p)) => held.op == p.op && held.mbr.equals(&p.mbr),
                    _ => false,
                })
    })
}

fn prdt_has_lock(
    chain: &LockChain,
    trx: TrxId,
    mode: LockMode,
    page: PageId,
    prdt: &Prdt,
) -> bool {
    chain.iter_heap(page, HeapNo::PRDT).any(|l| {
        l.trx_id() == trx
            && !l.type_mode.is_insert_intention()
            && !l.is_waiting()
            && l.mode().stronger_or_eq(mode)
            && (l.type_mode.is_prdt_page()
                || l
                    .prdt
                    .as_ref()
                    .is_some_and(|held| held.op == prdt.op && prdt_consistent(held, prdt, None)))
    })
}

fn prdt_other_has_conflicting(
    chain: &LockChain,
    trx: &Trx,
    type_mode: TypeMode,
    page: PageId,
    prdt: Option<&Prdt>,
) -> Option<TrxId> {
    chain
        .iter_heap(page, HeapNo::PRDT)
        .find(|l| prdt_has_to_wait(trx, type_mode, prdt, l))
        .map(|l| l.trx_id())
}

impl LockSys {
    /// Takes a predicate lock on `prdt`, or a page lock, on an R-tree page.
    pub fn prdt_lock(
        &self,
        trx: &Arc<Trx>,
        index: IndexRef,
        page: PageId,
        prdt: &Prdt,
        mode: LockMode,
        kind: PrdtLockKind,
    ) -> Result<LockStatus> {
        if !matches!(mode, LockMode::S | LockMode::X) {
            return Err(LockError::Invalid("predicate locks must be S or X"));
        }
        let lock_prdt = match kind {
            PrdtLockKind::Predicate if prdt.op.is_none() => {
                return Err(LockError::Invalid("predicate lock without a search operator"));
            }
            PrdtLockKind::Predicate => Some(*prdt),
            PrdtLockKind::Page => None,
        };
        let type_mode = TypeMode::with_flags(mode, kind.flag());
        let req = RecRequest {
            type_mode,
            index,
            page,
            heap: HeapNo::PRDT,
        };

        let hashes = self.hashes.read();
        let mut cells = hashes.get(HashKind::of(type_mode)).latch(page);
        let chain = cells.chain(page);

        let mut on_page = chain
            .locks
            .iter()
            .enumerate()
            .filter(|(_, l)| l.page == page)
            .map(|(i, _)| i);
        let first = on_page.next();
        let second = on_page.next();
        match (first, second) {
            (None, _) => {
                self.rec_create(chain, trx, req, lock_prdt);
                return Ok(LockStatus::GrantedNewLock);
            }
            (Some(pos), None)
                if chain.locks[pos].trx_id() == trx.id()
                    && chain.locks[pos].type_mode == type_mode
                    && !chain.locks[pos].bits.is_empty()
                    && (kind == PrdtLockKind::Page
                        || chain.locks[pos]
                            .prdt
                            .as_ref()
                            .is_some_and(|held| prdt_consistent(held, prdt, None))) =>
            {
                if chain.locks[pos].bits.set(HeapNo::PRDT) {
                    return Ok(LockStatus::GrantedNewLock);
                }
                return Ok(LockStatus::Granted);
            }
            _ => {}
        }

        if prdt_has_lock(chain, trx.id(), mode, page, prdt) {
            return Ok(LockStatus::Granted);
        }
        if let Some(blocker) =
            prdt_other_has_conflicting(chain, trx, type_mode, page, lock_prdt.as_ref())
        {
            return self.rec_enqueue_waiting(chain, trx, req, lock_prdt, blocker);
        }
        self.prdt_add_to_queue(chain, trx, type_mode, index, page, lock_prdt);
        Ok(LockStatus::GrantedNewLock)
    }

    /// Adds a predicate or page lock without a conflict check, extending a
    /// matching lock of the same transaction when nobody waits on the page.
    pub(crate) fn prdt_add_to_queue(
        &self,
        chain: &mut LockChain,
        trx: &Arc<Trx>,
        type_mode: TypeMode,
        index: IndexRef,
        page: PageId,
        prdt: Option<Prdt>,
    ) -> LockId {
        if !type_mode.is_waiting()
            && !chain
                .iter_heap(page, HeapNo::PRDT)
                .any(|l| l.is_waiting())
        {
            if let Some(pos) = prdt_find_on_page(chain, trx.id(), type_mode, page, prdt.as_ref()) {
                let lock = &mut chain.locks[pos];
                if let (Some(held), Some(p)) = (lock.prdt.as_mut(), prdt.as_ref()) {
                    held.mbr.enlarge(&p.mbr);
                }
                lock.bits.set(HeapNo::PRDT);
                return lock.id;
            }
        }
        let req = RecRequest {
            type_mode,
            index,
            page,
            heap: HeapNo::PRDT,
        };
        self.rec_create(chain, trx, req, prdt)
    }

    /// Takes a shared page lock unless `trx` already has one. Never waits.
    pub fn place_prdt_page_lock(
        &self,
        trx: &Arc<Trx>,
        index: IndexRef,
        page: PageId,
    ) -> Result<LockStatus> {
        let hashes = self.hashes.read();
        let mut cells = hashes.prdt_page.latch(page);
        let chain = cells.chain(page);
        if chain.iter_page(page).any(|l| l.trx_id() == trx.id()) {
            return Ok(LockStatus::Granted);
        }
        let req = RecRequest {
            type_mode: TypeMode::with_flags(LockMode::S, flags::PRDT_PAGE),
            index,
            page,
            heap: HeapNo::PRDT,
        };
        self.rec_create(chain, trx, req, None);
        Ok(LockStatus::GrantedNewLock)
    }

    /// True when no page lock exists on `page` or the first one belongs to
    /// `trx`.
    pub fn test_prdt_page_lock(&self, trx: &Trx, page: PageId) -> bool {
        let hashes = self.hashes.read();
        let mut cells = hashes.prdt_page.latch(page);
        cells
            .chain(page)
            .first_on_page(page)
            .map_or(true, |l| l.trx_id() == trx.id())
    }

    /// Checks whether inserting an entry with rectangle `mbr` must wait for
    /// a predicate lock of another transaction.
    ///
    /// No lock is created when the insert may proceed.
    pub fn prdt_insert_check_and_lock(
        &self,
        trx: &Arc<Trx>,
        index: IndexRef,
        page: PageId,
        mbr: Mbr,
    ) -> Result<LockStatus> {
        let prdt = Prdt::for_insert(mbr);
        let hashes = self.hashes.read();
        let mut cells = hashes.prdt.latch(page);
        let chain = cells.chain(page);
        if chain.iter_heap(page, HeapNo::PRDT).next().is_none() {
            return Ok(LockStatus::Granted);
        }
        let type_mode =
            TypeMode::with_flags(LockMode::X, flags::PREDICATE | flags::INSERT_INTENTION);
        match prdt_other_has_conflicting(chain, trx, type_mode, page, Some(&prdt)) {
            Some(blocker) => {
                let req = RecRequest {
                    type_mode,
                    index,
                    page,
                    heap: HeapNo::PRDT,
                };
                self.rec_enqueue_waiting(chain, trx, req, Some(prdt), blocker)
            }
            None => Ok(LockStatus::Granted),
        }
    }

    /// Propagates shared predicate locks of `parent` to the two halves of a
    /// split child whose rectangles they overlap.
    pub fn prdt_update_parent(
        &self,
        left: PageId,
        right: PageId,
        left_prdt: &Prdt,
        right_prdt: &Prdt,
        parent: PageId,
    ) {
        let hashes = self.hashes.read();
        let mut cells = hashes.prdt.latch_pages(&[left, right, parent]);
        let inherited: Vec<_> = cells
            .chain(parent)
            .iter_page(parent)
            .filter(|l| l.type_mode.is_predicate() && l.mode() != LockMode::X)
            .filter_map(|l| l.prdt.map(|p| (Arc::clone(&l.trx), l.type_mode, l.index, p)))
            .collect();
        for (trx, type_mode, index, lock_prdt) in inherited {
            for (child, child_prdt) in [(left, left_prdt), (right, right_prdt)] {
                if prdt_consistent(&lock_prdt, child_prdt, Some(PrdtOp::Disjoint)) {
                    continue;
                }
                let chain = cells.chain(child);
                if prdt_find_on_page(chain, trx.id(), type_mode, child, Some(&lock_prdt)).is_none()
                {
                    self.prdt_add_to_queue(chain, &trx, type_mode, index, child, Some(lock_prdt));
                }
            }
        }
        debug!(left = left.0, right = right.0, parent = parent.0, "lock.prdt.update_parent");
    }

    /// Copies to `new_page` the shared predicate locks of `page` that overlap
    /// `new_prdt`, and duplicates every granted page lock.
    pub fn prdt_update_split(&self, new_page: PageId, new_prdt: &Prdt, page: PageId) {
        let hashes = self.hashes.read();
        {
            let mut cells = hashes.prdt.latch_pages(&[new_page, page]);
            let copied: Vec<_> = cells
                .chain(page)
                .iter_page(page)
                .filter(|l| l.mode() != LockMode::X && !l.is_waiting())
                .filter_map(|l| l.prdt.map(|p| (Arc::clone(&l.trx), l.type_mode, l.index, p)))
                .filter(|(_, _, _, p)| !prdt_consistent(p, new_prdt, Some(PrdtOp::Disjoint)))
                .collect();
            let chain = cells.chain(new_page);
            for (trx, type_mode, index, lock_prdt) in copied {
                self.prdt_add_to_queue(chain, &trx, type_mode, index, new_page, Some(lock_prdt));
            }
        }
        let mut cells = hashes.prdt_page.latch_pages(&[new_page, page]);
        let copied: Vec<_> = cells
            .chain(page)
            .iter_page(page)
            .filter(|l| !l.is_waiting())
            .map(|l| (Arc::clone(&l.trx), l.type_mode, l.index))
            .collect();
        let chain = cells.chain(new_page);
        for (trx, type_mode, index) in copied {
            self.prdt_add_to_queue(chain, &trx, type_mode, index, new_page, None);
        }
    }

    /// Moves every predicate lock of `donor` to `receiver`, keeping waiting
    /// requests waiting.
    pub fn prdt_rec_move(&self, receiver: PageId, donor: PageId) {
        let hashes = self.hashes.read();
        let mut cells = hashes.prdt.latch_pages(&[receiver, donor]);
        let moved = super::migrate::strip(cells.chain(donor), donor, HeapNo::PRDT);
        let chain = cells.chain(receiver);
        for m in moved {
            self.prdt_add_to_queue(chain, &m.trx, m.type_mode, m.index, receiver, m.prdt);
        }
    }

    /// Drops the locks of a discarded R-tree page: page locks and record
    /// locks always, predicate locks when `all` is set.
    pub fn prdt_page_free_from_discard(&self, page: PageId, all: bool) {
        let hashes = self.hashes.read();
        let mut kinds = vec![HashKind::PrdtPage];
        if all {
            kinds.push(HashKind::Predicate);
        }
        kinds.push(HashKind::Record);
        for kind in kinds {
            let mut cells = hashes.get(kind).latch(page);
            let locks = cells.chain(page).drain_page(page);
            self.discard(locks);
        }
    }
}
