//! Low-level primitives for the lock manager.

/// Latches protecting lock hash cells.
///
/// Spin and OS-backed mutual exclusion behind one trait, with an optional
/// elision fast path.
pub mod latch;
