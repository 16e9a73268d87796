//! Transactional lock manager for a B-tree storage engine.
//!
//! The crate provides record, gap, next-key and insert-intention locks kept
//! in latched hash tables, table and AUTO_INC locks, spatial predicate
//! locks for R-trees, deadlock detection, and the hooks a B-tree calls to
//! keep locks attached to records as pages split, merge and reorganize.
//! Everything hangs off a [`lock::LockSys`].

#![warn(missing_docs)]

pub mod lock;
pub mod primitives;
pub mod types;

pub use lock::{IsolationLevel, LockMode, LockStatus, LockSys, LockSysOptions, Trx, TypeMode};
pub use types::{HeapNo, IndexId, IndexRef, LockError, PageId, Result, TableId, TrxId};
