//! Lock entries stored in hash chains and table queues, and the typed handles
//! transactions keep to find them again.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::bitmap::HeapBitmap;
use super::mode::{LockMode, TypeMode};
use super::prdt::Prdt;
use super::trx::Trx;
use crate::types::{HeapNo, IndexRef, LockId, PageId, TableId, TrxId};

/// Which of the three record lock hash tables a lock lives in.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize)]
pub enum HashKind {
    /// Ordinary record and gap locks.
    Record,
    /// Spatial predicate locks.
    Predicate,
    /// R-tree page locks.
    PrdtPage,
}

impl HashKind {
    /// Picks the hash table from the lock flags.
    pub fn of(type_mode: TypeMode) -> Self {
        if type_mode.is_prdt_page() {
            HashKind::PrdtPage
        } else if type_mode.is_predicate() {
            HashKind::Predicate
        } else {
            HashKind::Record
        }
    }

    /// Short name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            HashKind::Record => "record",
            HashKind::Predicate => "predicate",
            HashKind::PrdtPage => "page",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record, predicate or page lock.
#[derive(Clone)]
pub(crate) struct RecLock {
    pub(crate) id: LockId,
    pub(crate) trx: Arc<Trx>,
    pub(crate) page: PageId,
    pub(crate) index: IndexRef,
    pub(crate) type_mode: TypeMode,
    pub(crate) bits: HeapBitmap,
    pub(crate) prdt: Option<Prdt>,
}

impl RecLock {
    #[inline]
    pub(crate) fn trx_id(&self) -> TrxId {
        self.trx.id()
    }

    #[inline]
    pub(crate) fn is_waiting(&self) -> bool {
        self.type_mode.is_waiting()
    }

    #[inline]
    pub(crate) fn has_bit(&self, heap: HeapNo) -> bool {
        self.bits.get(heap)
    }

    #[inline]
    pub(crate) fn mode(&self) -> LockMode {
        self.type_mode.mode()
    }

    pub(crate) fn handle(&self) -> LockRef {
        LockRef::Rec {
            hash: HashKind::of(self.type_mode),
            page: self.page,
            id: self.id,
        }
    }
}

impl fmt::Debug for RecLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecLock")
            .field("id", &self.id)
            .field("trx", &self.trx.id())
            .field("page", &self.page)
            .field("type_mode", &self.type_mode)
            .field("bits", &self.bits)
            .finish()
    }
}

/// An entry in a table's lock queue.
#[derive(Clone)]
pub(crate) struct TableLock {
    pub(crate) id: LockId,
    pub(crate) trx: Arc<Trx>,
    pub(crate) table: TableId,
    pub(crate) type_mode: TypeMode,
}

impl fmt::Debug for TableLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableLock")
            .field("id", &self.id)
            .field("trx", &self.trx.id())
            .field("table", &self.table)
            .field("type_mode", &self.type_mode)
            .finish()
    }
}

impl TableLock {
    #[inline]
    pub(crate) fn is_waiting(&self) -> bool {
        self.type_mode.is_waiting()
    }

    #[inline]
    pub(crate) fn mode(&self) -> LockMode {
        self.type_mode.mode()
    }

    pub(crate) fn handle(&self) -> LockRef {
        LockRef::Table {
            table: self.table,
            mode: self.mode(),
            id: self.id,
        }
    }
}

/// Handle a transaction keeps for each of its locks.
///
/// Lock ids are never reused, so a handle whose lock has been removed or
/// relocated simply fails to resolve.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum LockRef {
    Rec {
        hash: HashKind,
        page: PageId,
        id: LockId,
    },
    Table {
        table: TableId,
        mode: LockMode,
        id: LockId,
    },
}

impl LockRef {
    #[inline]
    pub(crate) fn id(self) -> LockId {
        match self {
            LockRef::Rec { id, .. } | LockRef::Table { id, .. } => id,
        }
    }
}
