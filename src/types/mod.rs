//! Identifiers and the error type shared by every lock manager module.

use std::fmt;

use serde::Serialize;

/// Identifier of an index page, as handed out by the buffer pool.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct PageId(pub u64);

/// Slot number of a record within its page.
///
/// Heap numbers 0 and 1 are reserved for the page's infimum and supremum
/// sentinel records; user records start at [`HeapNo::USER_LOW`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct HeapNo(pub u16);

impl HeapNo {
    /// The infimum (low sentinel) record of every page.
    pub const INFIMUM: HeapNo = HeapNo(0);
    /// The supremum (high sentinel) record of every page.
    pub const SUPREMUM: HeapNo = HeapNo(1);
    /// First heap number available to user records.
    pub const USER_LOW: HeapNo = HeapNo(2);
    /// Heap number used by predicate and R-tree page locks.
    pub const PRDT: HeapNo = HeapNo(0);

    /// Returns true for the supremum record.
    #[inline]
    pub fn is_supremum(self) -> bool {
        self == Self::SUPREMUM
    }
}

/// Transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct TrxId(pub u64);

/// Table identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct TableId(pub u64);

/// Index identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct IndexId(pub u64);

/// Unique identity of a lock object. Never reused within one lock system.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct LockId(pub u64);

/// The index a record lock is taken on.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize)]
pub struct IndexRef {
    /// Table owning the index.
    pub table: TableId,
    /// Index identifier.
    pub id: IndexId,
    /// Whether this is the clustered (primary key) index.
    pub clustered: bool,
}

impl IndexRef {
    /// Describes a clustered index.
    pub fn clustered(table: TableId, id: IndexId) -> Self {
        Self {
            table,
            id,
            clustered: true,
        }
    }

    /// Describes a secondary index.
    pub fn secondary(table: TableId, id: IndexId) -> Self {
        Self {
            table,
            id,
            clustered: false,
        }
    }
}

/// Errors surfaced by the lock manager.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The transaction was chosen as a deadlock victim.
    #[error("deadlock found when trying to get lock")]
    Deadlock,
    /// The lock wait exceeded the configured timeout.
    #[error("lock wait timeout exceeded")]
    LockWaitTimeout,
    /// The wait was cancelled from another thread.
    #[error("lock wait interrupted")]
    Interrupted,
    /// Persistent state references something impossible.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller violated an API precondition.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Convenience alias for results returned by the lock manager.
pub type Result<T> = std::result::Result<T, LockError>;

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for HeapNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<u16> for HeapNo {
    fn from(value: u16) -> Self {
        HeapNo(value)
    }
}

impl From<u64> for TrxId {
    fn from(value: u64) -> Self {
        TrxId(value)
    }
}
