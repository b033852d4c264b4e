//! Sequence and view numbering for the replica's sub-protocols.

use std::fmt;

use either::{Either, Left, Right};
use serde::{Deserialize, Serialize};

use crate::bft::checkpoint;

/// Size of the watermark window above the stable checkpoint within
/// which sequence numbers are accepted.
///
/// Bounds the memory held by in-flight consensus instances, and stops a
/// faulty primary from exhausting the sequence space with a huge number.
pub const WINDOW: u64 = 4 * checkpoint::PERIOD;

/// A sequence number attributed to a client request by the primary.
///
/// Sequence numbers start at 1 and never wrap; `SeqNo::ZERO` marks an
/// unassigned request.
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqNo(u64);

/// The number of a view, i.e. the epoch that fixes which replica
/// proposes. Advances by one per successful view change.
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(u64);

/// Classification of a sequence number relative to the watermark window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InvalidSeqNo {
    /// At or below the low watermark; the message is stale.
    Small,
    /// Beyond the high watermark.
    Big,
}

impl SeqNo {
    pub const ZERO: Self = SeqNo(0);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    /// Positions this sequence number inside the watermark window
    /// `(low, low + WINDOW]`.
    ///
    /// Returns the offset from the low watermark on success, suitable
    /// for indexing per-window storage.
    #[inline]
    pub fn index(self, low: SeqNo) -> Either<InvalidSeqNo, usize> {
        if self.0 <= low.0 {
            Left(InvalidSeqNo::Small)
        } else if self.0 > low.0 + WINDOW {
            Left(InvalidSeqNo::Big)
        } else {
            Right((self.0 - low.0 - 1) as usize)
        }
    }
}

impl ViewId {
    pub const ZERO: Self = ViewId(0);

    /// Returns the following view number.
    #[inline]
    pub fn next(self) -> ViewId {
        ViewId(self.0 + 1)
    }
}

impl From<u64> for SeqNo {
    #[inline]
    fn from(sequence_number: u64) -> SeqNo {
        SeqNo(sequence_number)
    }
}

impl From<SeqNo> for u64 {
    #[inline]
    fn from(sequence_number: SeqNo) -> u64 {
        sequence_number.0
    }
}

impl From<u64> for ViewId {
    #[inline]
    fn from(view: u64) -> ViewId {
        ViewId(view)
    }
}

impl From<ViewId> for u64 {
    #[inline]
    fn from(view: ViewId) -> u64 {
        view.0
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Types with an associated sequence number.
pub trait Orderable {
    /// Reports the sequence number of this value.
    fn sequence_number(&self) -> SeqNo;
}

impl Orderable for SeqNo {
    fn sequence_number(&self) -> SeqNo {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_classifies_window_bounds() {
        let low = SeqNo::from(10);

        assert_eq!(SeqNo::from(10).index(low), Left(InvalidSeqNo::Small));
        assert_eq!(SeqNo::from(4).index(low), Left(InvalidSeqNo::Small));
        assert_eq!(SeqNo::from(11).index(low), Right(0));
        assert_eq!(SeqNo::from(10 + WINDOW).index(low), Right(WINDOW as usize - 1));
        assert_eq!(SeqNo::from(11 + WINDOW).index(low), Left(InvalidSeqNo::Big));
    }

    #[test]
    fn next_is_monotonic() {
        let s = SeqNo::ZERO;
        assert_eq!(u64::from(s.next()), 1);
        assert!(s.next() > s);
        assert_eq!(ViewId::from(7).next(), ViewId::from(8));
    }
}
