//! Lock modes, the compatibility and strength matrices, and lock flags.

use std::fmt;

use serde::Serialize;

/// Basic lock mode.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize)]
pub enum LockMode {
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared.
    S,
    /// Exclusive.
    X,
    /// Table-level auto-increment lock, held for one statement.
    AutoInc,
}

const fn idx(mode: LockMode) -> usize {
    match mode {
        LockMode::IS => 0,
        LockMode::IX => 1,
        LockMode::S => 2,
        LockMode::X => 3,
        LockMode::AutoInc => 4,
    }
}

// Rows: requested mode. Columns: mode already present.
//        IS     IX     S      X      AI
const COMPATIBILITY: [[bool; 5]; 5] = [
    [true, true, true, false, true],     // IS
    [true, true, false, false, true],    // IX
    [true, false, true, false, false],   // S
    [false, false, false, false, false], // X
    [true, true, false, false, false],   // AI
];

// Rows: held mode. Columns: mode it must cover.
//        IS     IX     S      X      AI
const STRENGTH: [[bool; 5]; 5] = [
    [true, false, false, false, false], // IS
    [true, true, false, false, false],  // IX
    [true, false, true, false, false],  // S
    [true, true, true, true, true],     // X
    [false, false, false, false, true], // AI
];

impl LockMode {
    /// Every mode, in matrix order.
    pub const ALL: [LockMode; 5] = [
        LockMode::IS,
        LockMode::IX,
        LockMode::S,
        LockMode::X,
        LockMode::AutoInc,
    ];

    /// Whether a lock in `self` may coexist with one in `other` held by
    /// another transaction.
    #[inline]
    pub fn compatible(self, other: LockMode) -> bool {
        COMPATIBILITY[idx(self)][idx(other)]
    }

    /// Whether holding `self` covers a request for `other`.
    #[inline]
    pub fn stronger_or_eq(self, other: LockMode) -> bool {
        STRENGTH[idx(self)][idx(other)]
    }

    /// Short name used in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::IS => "IS",
            LockMode::IX => "IX",
            LockMode::S => "S",
            LockMode::X => "X",
            LockMode::AutoInc => "AUTO-INC",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flag bits combined with a [`LockMode`] into a [`TypeMode`].
pub mod flags {
    /// The request is waiting to be granted.
    pub const WAIT: u32 = 1 << 8;
    /// Locks only the gap before the record.
    pub const GAP: u32 = 1 << 9;
    /// Locks only the record, not the gap before it.
    pub const REC_NOT_GAP: u32 = 1 << 10;
    /// Insert intention: a gap lock that waits but is never waited on.
    pub const INSERT_INTENTION: u32 = 1 << 11;
    /// Spatial predicate lock.
    pub const PREDICATE: u32 = 1 << 13;
    /// R-tree page lock.
    pub const PRDT_PAGE: u32 = 1 << 14;

    /// Every flag bit.
    pub const ALL: u32 = WAIT | GAP | REC_NOT_GAP | INSERT_INTENTION | PREDICATE | PRDT_PAGE;
}

/// A lock mode together with its flag set.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize)]
pub struct TypeMode {
    mode: LockMode,
    flags: u32,
}

impl TypeMode {
    /// Plain mode with no flags (a next-key lock for records).
    pub const fn new(mode: LockMode) -> Self {
        Self { mode, flags: 0 }
    }

    /// Builds a type mode from raw flag bits; unknown bits are dropped.
    pub const fn with_flags(mode: LockMode, flags: u32) -> Self {
        Self {
            mode,
            flags: flags & flags::ALL,
        }
    }

    /// Adds flag bits.
    pub const fn with(self, bits: u32) -> Self {
        Self::with_flags(self.mode, self.flags | bits)
    }

    /// Removes flag bits.
    pub const fn without(self, bits: u32) -> Self {
        Self {
            mode: self.mode,
            flags: self.flags & !bits,
        }
    }

    /// `mode | GAP`.
    pub const fn gap(mode: LockMode) -> Self {
        Self::with_flags(mode, flags::GAP)
    }

    /// `mode | REC_NOT_GAP`.
    pub const fn rec_not_gap(mode: LockMode) -> Self {
        Self::with_flags(mode, flags::REC_NOT_GAP)
    }

    /// `X | GAP | INSERT_INTENTION`, the insert-intention request.
    pub const fn insert_intention() -> Self {
        Self::with_flags(LockMode::X, flags::GAP | flags::INSERT_INTENTION)
    }

    /// The basic mode.
    #[inline]
    pub fn mode(self) -> LockMode {
        self.mode
    }

    /// The raw flag bits.
    #[inline]
    pub fn flags(self) -> u32 {
        self.flags
    }

    /// Whether every bit of `bits` is set.
    #[inline]
    pub fn has(self, bits: u32) -> bool {
        self.flags & bits == bits
    }

    /// Waiting flag.
    #[inline]
    pub fn is_waiting(self) -> bool {
        self.has(flags::WAIT)
    }

    /// Gap flag.
    #[inline]
    pub fn is_gap(self) -> bool {
        self.has(flags::GAP)
    }

    /// Record-not-gap flag.
    #[inline]
    pub fn is_rec_not_gap(self) -> bool {
        self.has(flags::REC_NOT_GAP)
    }

    /// Insert-intention flag.
    #[inline]
    pub fn is_insert_intention(self) -> bool {
        self.has(flags::INSERT_INTENTION)
    }

    /// Predicate flag.
    #[inline]
    pub fn is_predicate(self) -> bool {
        self.has(flags::PREDICATE)
    }

    /// R-tree page flag.
    #[inline]
    pub fn is_prdt_page(self) -> bool {
        self.has(flags::PRDT_PAGE)
    }
}

impl From<LockMode> for TypeMode {
    fn from(mode: LockMode) -> Self {
        TypeMode::new(mode)
    }
}

impl fmt::Display for TypeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock_mode {}", self.mode)?;
        if self.is_predicate() {
            f.write_str(" predicate")?;
        }
        if self.is_prdt_page() {
            f.write_str(" page")?;
        }
        if self.is_gap() {
            f.write_str(" locks gap before rec")?;
        }
        if self.is_rec_not_gap() {
            f.write_str(" locks rec but not gap")?;
        }
        if self.is_insert_intention() {
            f.write_str(" insert intention")?;
        }
        if self.is_waiting() {
            f.write_str(" waiting")?;
        }
        Ok(())
    }
}
