//! Segment aggregation
//!
//! Pure counter arithmetic for a release's segment inventory. The store calls
//! these functions inside the same transaction as the segment insert/delete,
//! so the completeness invariant (`has_parts == (part_count > 0)`) is enforced
//! and tested here without a database.

use std::fmt;

/// Completeness counters stored on a release row
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseCounters {
    /// Segments currently on file
    pub part_count: u32,
    /// Sum of known segment sizes
    pub size_bytes: u64,
    /// Readiness gate for search visibility
    pub has_parts: bool,
}

impl ReleaseCounters {
    /// Counters after a new segment of `size_bytes` is inserted
    #[must_use]
    pub fn with_added(self, size_bytes: u64) -> Self {
        let part_count = self.part_count.saturating_add(1);
        Self {
            part_count,
            size_bytes: self.size_bytes.saturating_add(size_bytes),
            has_parts: true,
        }
    }

    /// Counters after a segment of `size_bytes` is deleted
    #[must_use]
    pub fn with_removed(self, size_bytes: u64) -> Self {
        let part_count = self.part_count.saturating_sub(1);
        Self {
            part_count,
            size_bytes: self.size_bytes.saturating_sub(size_bytes),
            has_parts: part_count > 0,
        }
    }

    /// Counters after a segment's size changes from `old` to `new`
    #[must_use]
    pub fn with_resized(self, old: u64, new: u64) -> Self {
        Self {
            size_bytes: self.size_bytes.saturating_sub(old).saturating_add(new),
            ..self
        }
    }

    /// Counters recomputed from the segments actually on file
    #[must_use]
    pub fn from_segments<I>(sizes: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        sizes
            .into_iter()
            .fold(Self::default(), |acc, size| acc.with_added(size))
    }

    /// Whether `has_parts` agrees with `part_count`
    pub fn is_coherent(&self) -> bool {
        self.has_parts == (self.part_count > 0)
    }
}

/// Outcome of a segment write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentChange {
    /// New segment stored; counters updated
    Inserted,
    /// The slot was already filled; nothing changed
    Duplicate,
    /// Segment deleted; counters updated
    Removed,
    /// No segment in that slot; nothing changed
    Absent,
}

impl SegmentChange {
    /// Whether counters were modified
    pub fn changed(self) -> bool {
        matches!(self, SegmentChange::Inserted | SegmentChange::Removed)
    }
}

/// Why a release needs reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inconsistency {
    /// Release was flagged unavailable
    Unavailable,
    /// No segments are on file
    NoSegments,
    /// `part_count` disagrees with the stored segment count
    PartCountMismatch {
        /// Counter value
        recorded: u32,
        /// Segments on file
        actual: u32,
    },
    /// `size_bytes` disagrees with the stored segment sizes
    SizeMismatch {
        /// Counter value
        recorded: u64,
        /// Sum of segment sizes
        actual: u64,
    },
    /// `has_parts` disagrees with `part_count`
    HasPartsMismatch,
    /// Zero-size segments the peer has not been asked about yet
    UnknownSizes {
        /// Number of such segments
        count: u32,
    },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::Unavailable => write!(f, "flagged unavailable"),
            Inconsistency::NoSegments => write!(f, "no segments on file"),
            Inconsistency::PartCountMismatch { recorded, actual } => {
                write!(f, "part_count {} but {} segments on file", recorded, actual)
            }
            Inconsistency::SizeMismatch { recorded, actual } => {
                write!(f, "size_bytes {} but segments sum to {}", recorded, actual)
            }
            Inconsistency::HasPartsMismatch => write!(f, "has_parts disagrees with part_count"),
            Inconsistency::UnknownSizes { count } => {
                write!(f, "{} segments with unknown size", count)
            }
        }
    }
}

/// Compare stored counters against the segments on file
///
/// Returns every problem found; an empty list means the release is consistent
/// and reconciliation is a no-op. `unchecked_unknown` counts zero-size
/// segments whose size has not been looked up yet; a size the peer could not
/// supply is not flagged twice.
#[must_use]
pub fn check(
    counters: &ReleaseCounters,
    available: bool,
    segment_sizes: &[u64],
    unchecked_unknown: u32,
) -> Vec<Inconsistency> {
    let mut problems = Vec::new();
    if !available {
        problems.push(Inconsistency::Unavailable);
    }

    let actual = ReleaseCounters::from_segments(segment_sizes.iter().copied());
    if actual.part_count == 0 {
        problems.push(Inconsistency::NoSegments);
    }
    if counters.part_count != actual.part_count {
        problems.push(Inconsistency::PartCountMismatch {
            recorded: counters.part_count,
            actual: actual.part_count,
        });
    }
    if counters.size_bytes != actual.size_bytes {
        problems.push(Inconsistency::SizeMismatch {
            recorded: counters.size_bytes,
            actual: actual.size_bytes,
        });
    }
    if !counters.is_coherent() {
        problems.push(Inconsistency::HasPartsMismatch);
    }
    if unchecked_unknown > 0 {
        problems.push(Inconsistency::UnknownSizes {
            count: unchecked_unknown,
        });
    }
    problems
}
