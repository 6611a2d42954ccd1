//! Core data types shared by every cache variant.

use serde::{Deserialize, Serialize};

/// Token id.
pub type Token = u32;

/// Sequence id. `SEQ_ID_ALL` is the wildcard accepted by range and state operations.
pub type SeqId = i32;

/// Logical position of a token within its sequence. `-1` means "none".
pub type Pos = i32;

/// Maximum number of sequences representable by a [`SeqSet`].
pub const SEQ_MAX: usize = 64;

/// Wildcard sequence id: "every sequence". Never stored in a cell.
pub const SEQ_ID_ALL: SeqId = -1;

/// Returns true if `seq` is a storable sequence id.
#[inline]
pub fn is_valid_seq(seq: SeqId) -> bool {
    seq >= 0 && (seq as usize) < SEQ_MAX
}

/// Normalize a `[p0, p1)` range where negative bounds are open.
#[inline]
pub fn normalize_range(p0: Pos, p1: Pos) -> (Pos, Pos) {
    let p0 = if p0 < 0 { 0 } else { p0 };
    let p1 = if p1 < 0 { Pos::MAX } else { p1 };
    (p0, p1)
}

/// A set of sequence ids, stored as a 64-bit mask.
///
/// Used for the owners of a cache cell and for the sequences a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SeqSet(u64);

impl SeqSet {
    /// The empty set.
    pub const EMPTY: SeqSet = SeqSet(0);

    /// A set holding exactly `seq`. Invalid ids yield the empty set.
    pub fn single(seq: SeqId) -> Self {
        let mut set = Self::EMPTY;
        set.insert(seq);
        set
    }

    /// Build a set from a list of ids, ignoring invalid ones.
    pub fn from_ids(ids: &[SeqId]) -> Self {
        let mut set = Self::EMPTY;
        for &id in ids {
            set.insert(id);
        }
        set
    }

    /// Raw bit mask.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Whether `seq` is a member.
    pub fn contains(self, seq: SeqId) -> bool {
        is_valid_seq(seq) && self.0 & (1u64 << seq) != 0
    }

    /// Insert `seq`; returns true if it was not present.
    pub fn insert(&mut self, seq: SeqId) -> bool {
        if !is_valid_seq(seq) {
            return false;
        }
        let had = self.contains(seq);
        self.0 |= 1u64 << seq;
        !had
    }

    /// Remove `seq`; returns true if it was present.
    pub fn remove(&mut self, seq: SeqId) -> bool {
        if !self.contains(seq) {
            return false;
        }
        self.0 &= !(1u64 << seq);
        true
    }

    /// Remove every member.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Number of members.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Smallest member.
    pub fn first(self) -> Option<SeqId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as SeqId)
        }
    }

    /// Whether the two sets share at least one member.
    pub fn intersects(self, other: SeqSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether every member of `self` is in `other`.
    pub fn is_subset(self, other: SeqSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// Union of both sets.
    pub fn union(self, other: SeqSet) -> SeqSet {
        SeqSet(self.0 | other.0)
    }

    /// Iterate members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = SeqId> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let seq = bits.trailing_zeros();
            bits &= bits - 1;
            Some(seq as SeqId)
        })
    }
}

/// Outcome of a prepare or update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    /// The context is ready to be applied.
    Success,
    /// Nothing to do. Not an error.
    NoUpdate,
    /// Not enough free cells or slots. Recoverable by freeing sequences.
    FailedPrepare,
    /// The compute step rejected the context; the cache was rolled back.
    FailedCompute,
}

impl MemoryStatus {
    /// Whether the status is one of the failure values.
    pub fn is_fail(self) -> bool {
        matches!(self, Self::FailedPrepare | Self::FailedCompute)
    }

    fn severity(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::NoUpdate => 1,
            Self::FailedPrepare | Self::FailedCompute => 2,
        }
    }

    /// Combine two sub-cache statuses: the worst one wins.
    ///
    /// Failures dominate `NoUpdate`, which dominates `Success`. On equal
    /// severity the first status is kept.
    pub fn combine(self, other: MemoryStatus) -> MemoryStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Combine the statuses of two update requests.
    ///
    /// A failure still dominates, but if either side has pending work the
    /// combined request must run, so `Success` beats `NoUpdate`.
    pub fn combine_update(self, other: MemoryStatus) -> MemoryStatus {
        match (self, other) {
            (s, _) if s.is_fail() => s,
            (_, o) if o.is_fail() => o,
            (Self::Success, _) | (_, Self::Success) => Self::Success,
            _ => Self::NoUpdate,
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NoUpdate => write!(f, "no_update"),
            Self::FailedPrepare => write!(f, "failed_prepare"),
            Self::FailedCompute => write!(f, "failed_compute"),
        }
    }
}

/// Flags for sequence state serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StateFlags(u32);

impl StateFlags {
    /// Serialize only the sliding-window part of an ISWA cache.
    pub const SWA_ONLY: StateFlags = StateFlags(1);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw flag bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set.
    pub fn contains(self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for StateFlags {
    type Output = StateFlags;

    fn bitor(self, rhs: StateFlags) -> StateFlags {
        StateFlags(self.0 | rhs.0)
    }
}
