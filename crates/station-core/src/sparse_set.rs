//! Compact set of `u64` indices stored as sorted, disjoint ranges.
//!
//! Validity flags for a board cover millions of samples, but almost all of
//! them sit in a handful of long runs: everything arrived, or a stretch was
//! lost. [`SparseSet`] stores only the run boundaries, so include/exclude cost
//! `O(log k)` to locate plus the number of ranges actually touched.
//!
//! Ranges never overlap and never touch; adjacent ranges are merged on
//! insertion, so two sets with the same members always have identical
//! range lists.
//!
//! # Example
//!
//! ```
//! use station_core::SparseSet;
//!
//! let mut set = SparseSet::new();
//! set.include(0, 10)?.exclude(3, 5)?;
//! assert_eq!(set.count(), 8);
//! assert!(!set.test(4));
//! assert_eq!(set.to_string(), "[0..3) [5..10)");
//! # Ok::<(), station_core::SparseSetError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::SparseSetError;

/// Half-open interval `[begin, end)` with `begin < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// First member
    pub begin: u64,
    /// One past the last member
    pub end: u64,
}

impl Range {
    /// Number of members.
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    /// Always false; ranges are never empty. Present for clippy's `len` convention.
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// Whether `index` lies inside the range.
    pub fn contains(&self, index: u64) -> bool {
        self.begin <= index && index < self.end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.begin, self.end)
    }
}

/// Ordered set of disjoint, non-adjacent [`Range`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SparseSet {
    ranges: Vec<Range>,
}

fn check(begin: u64, end: u64) -> Result<(), SparseSetError> {
    if begin >= end {
        return Err(SparseSetError::InvalidRange { begin, end });
    }
    Ok(())
}

impl SparseSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding exactly `[begin, end)`; empty if `begin >= end`.
    pub fn from_range(begin: u64, end: u64) -> Self {
        let mut set = Self::new();
        if begin < end {
            set.ranges.push(Range { begin, end });
        }
        set
    }

    /// Add `[begin, end)`, merging with overlapping or adjacent ranges.
    pub fn include(&mut self, begin: u64, end: u64) -> Result<&mut Self, SparseSetError> {
        check(begin, end)?;

        // ranges[first..last] overlap or touch [begin, end)
        let first = self.ranges.partition_point(|r| r.end < begin);
        let last = self.ranges.partition_point(|r| r.begin <= end);

        if first == last {
            self.ranges.insert(first, Range { begin, end });
        } else {
            let merged = Range {
                begin: begin.min(self.ranges[first].begin),
                end: end.max(self.ranges[last - 1].end),
            };
            self.ranges.splice(first..last, std::iter::once(merged));
        }
        Ok(self)
    }

    /// Add a single index.
    pub fn include_index(&mut self, index: u64) -> Result<&mut Self, SparseSetError> {
        let end = index
            .checked_add(1)
            .ok_or(SparseSetError::InvalidRange { begin: index, end: index })?;
        self.include(index, end)
    }

    /// Remove `[begin, end)`, splitting a range that strictly contains it.
    pub fn exclude(&mut self, begin: u64, end: u64) -> Result<&mut Self, SparseSetError> {
        check(begin, end)?;

        // ranges[first..last] intersect [begin, end)
        let first = self.ranges.partition_point(|r| r.end <= begin);
        let last = self.ranges.partition_point(|r| r.begin < end);
        if first >= last {
            return Ok(self);
        }

        let head = self.ranges[first];
        let tail = self.ranges[last - 1];
        let mut keep = Vec::with_capacity(2);
        if head.begin < begin {
            keep.push(Range {
                begin: head.begin,
                end: begin,
            });
        }
        if tail.end > end {
            keep.push(Range {
                begin: end,
                end: tail.end,
            });
        }
        self.ranges.splice(first..last, keep);
        Ok(self)
    }

    /// Remove a single index.
    pub fn exclude_index(&mut self, index: u64) -> Result<&mut Self, SparseSetError> {
        let end = index
            .checked_add(1)
            .ok_or(SparseSetError::InvalidRange { begin: index, end: index })?;
        self.exclude(index, end)
    }

    /// Remove every member.
    pub fn reset(&mut self) -> &mut Self {
        self.ranges.clear();
        self
    }

    /// Set union.
    pub fn union(&self, other: &SparseSet) -> SparseSet {
        let mut ranges: Vec<Range> = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        let mut lhs = self.ranges.iter().peekable();
        let mut rhs = other.ranges.iter().peekable();

        loop {
            let next = match (lhs.peek(), rhs.peek()) {
                (Some(a), Some(b)) if a.begin <= b.begin => lhs.next(),
                (Some(_), Some(_)) => rhs.next(),
                (Some(_), None) => lhs.next(),
                (None, Some(_)) => rhs.next(),
                (None, None) => break,
            };
            let Some(&range) = next else { break };
            match ranges.last_mut() {
                Some(last) if range.begin <= last.end => last.end = last.end.max(range.end),
                _ => ranges.push(range),
            }
        }

        SparseSet { ranges }
    }

    /// Set difference `self \ other`.
    pub fn subtract(&self, other: &SparseSet) -> SparseSet {
        let mut result = self.clone();
        for range in &other.ranges {
            // ranges held by a set are always valid
            let _ = result.exclude(range.begin, range.end);
        }
        result
    }

    /// Translate every bound by `-offset`.
    ///
    /// Ranges that end at or below `offset` disappear; a range straddling
    /// `offset` is clipped to start at 0.
    pub fn shift(&mut self, offset: u64) -> &mut Self {
        if offset == 0 {
            return self;
        }
        self.ranges.retain_mut(|r| {
            r.end = r.end.saturating_sub(offset);
            r.begin = r.begin.saturating_sub(offset);
            r.end > 0
        });
        self
    }

    /// Members that fall inside `[begin, end)`.
    pub fn subset(&self, begin: u64, end: u64) -> SparseSet {
        if begin >= end {
            return SparseSet::new();
        }
        let first = self.ranges.partition_point(|r| r.end <= begin);
        let last = self.ranges.partition_point(|r| r.begin < end);
        let ranges = self.ranges[first..last.max(first)]
            .iter()
            .map(|r| Range {
                begin: r.begin.max(begin),
                end: r.end.min(end),
            })
            .collect();
        SparseSet { ranges }
    }

    /// Complement of this set within `[begin, end)`.
    pub fn invert(&self, begin: u64, end: u64) -> SparseSet {
        let mut result = SparseSet::from_range(begin, end);
        if !result.is_empty() {
            result = result.subtract(&self.subset(begin, end));
        }
        result
    }

    /// Whether `index` is a member.
    pub fn test(&self, index: u64) -> bool {
        let pos = self.ranges.partition_point(|r| r.end <= index);
        self.ranges.get(pos).is_some_and(|r| r.contains(index))
    }

    /// Whether every index of `[begin, end)` is a member.
    pub fn covers(&self, begin: u64, end: u64) -> bool {
        if begin >= end {
            return true;
        }
        let pos = self.ranges.partition_point(|r| r.end <= begin);
        self.ranges
            .get(pos)
            .is_some_and(|r| r.begin <= begin && end <= r.end)
    }

    /// Number of members.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(Range::len).sum()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The ranges, ascending.
    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Drop the lowest ranges until at most `max_ranges` remain.
    ///
    /// Returns the number of members removed.
    pub fn truncate_front(&mut self, max_ranges: usize) -> u64 {
        if self.ranges.len() <= max_ranges {
            return 0;
        }
        let excess = self.ranges.len() - max_ranges;
        self.ranges.drain(..excess).map(|r| r.len()).sum()
    }

    /// Number of `u64` words [`marshal`](Self::marshal) needs for `max_ranges`.
    pub const fn marshalled_words(max_ranges: usize) -> usize {
        1 + 2 * max_ranges
    }

    /// Write the set as `[count, b0, e0, b1, e1, ...]` into `words`.
    ///
    /// Fails without touching `words` when the set does not fit.
    pub fn marshal(&self, words: &mut [u64]) -> Result<(), SparseSetError> {
        let capacity = words.len().saturating_sub(1) / 2;
        if self.ranges.len() > capacity {
            return Err(SparseSetError::CapacityExceeded {
                ranges: self.ranges.len(),
                capacity,
            });
        }
        words[0] = self.ranges.len() as u64;
        for (slot, range) in words[1..].chunks_exact_mut(2).zip(&self.ranges) {
            slot[0] = range.begin;
            slot[1] = range.end;
        }
        Ok(())
    }

    /// Rebuild a set written by [`marshal`](Self::marshal).
    pub fn unmarshal(words: &[u64]) -> Result<SparseSet, SparseSetError> {
        let Some((&count, body)) = words.split_first() else {
            return Err(SparseSetError::Corrupt("empty buffer"));
        };
        let count = usize::try_from(count).map_err(|_| SparseSetError::Corrupt("bad count"))?;
        if count > body.len() / 2 {
            return Err(SparseSetError::Corrupt("count exceeds buffer"));
        }

        let mut ranges = Vec::with_capacity(count);
        let mut previous_end: Option<u64> = None;
        for pair in body.chunks_exact(2).take(count) {
            let range = Range {
                begin: pair[0],
                end: pair[1],
            };
            if range.begin >= range.end {
                return Err(SparseSetError::Corrupt("empty range"));
            }
            if previous_end.is_some_and(|end| range.begin <= end) {
                return Err(SparseSetError::Corrupt("ranges out of order"));
            }
            previous_end = Some(range.end);
            ranges.push(range);
        }
        Ok(SparseSet { ranges })
    }
}

impl BitOr for &SparseSet {
    type Output = SparseSet;

    fn bitor(self, rhs: &SparseSet) -> SparseSet {
        self.union(rhs)
    }
}

impl BitOrAssign<&SparseSet> for SparseSet {
    fn bitor_assign(&mut self, rhs: &SparseSet) {
        *self = self.union(rhs);
    }
}

impl fmt::Display for SparseSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(set: &SparseSet, universe: u64) -> Vec<u64> {
        (0..universe).filter(|&i| set.test(i)).collect()
    }

    #[test]
    fn test_include_merges_adjacent_and_overlapping() {
        let mut set = SparseSet::new();
        set.include(10, 20).unwrap();
        set.include(20, 25).unwrap();
        assert_eq!(set.ranges(), &[Range { begin: 10, end: 25 }]);

        set.include(5, 8).unwrap().include(7, 11).unwrap();
        assert_eq!(set.ranges(), &[Range { begin: 5, end: 25 }]);
        assert_eq!(set.count(), 20);
    }

    #[test]
    fn test_include_spanning_many_ranges() {
        let mut set = SparseSet::new();
        for i in 0..10 {
            set.include(i * 10, i * 10 + 2).unwrap();
        }
        assert_eq!(set.ranges().len(), 10);
        set.include(15, 75).unwrap();
        assert_eq!(
            set.to_string(),
            "[0..2) [10..75) [80..82) [90..92)"
        );
    }

    #[test]
    fn test_exclude_splits_range() {
        let mut set = SparseSet::from_range(0, 100);
        set.exclude(40, 60).unwrap();
        assert_eq!(set.to_string(), "[0..40) [60..100)");
        set.exclude(0, 1).unwrap().exclude(99, 200).unwrap();
        assert_eq!(set.to_string(), "[1..40) [60..99)");
        set.exclude(30, 70).unwrap();
        assert_eq!(set.to_string(), "[1..30) [70..99)");
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let mut set = SparseSet::new();
        assert_eq!(
            set.include(5, 5).unwrap_err(),
            SparseSetError::InvalidRange { begin: 5, end: 5 }
        );
        assert!(set.exclude(7, 3).is_err());
        assert!(set.include_index(u64::MAX).is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn test_union_and_subtract() {
        let mut a = SparseSet::new();
        a.include(0, 5).unwrap().include(10, 15).unwrap();
        let mut b = SparseSet::new();
        b.include(5, 7).unwrap().include(12, 20).unwrap();

        let union = a.union(&b);
        assert_eq!(union.to_string(), "[0..7) [10..20)");
        assert_eq!(&a | &b, union);

        let diff = union.subtract(&b);
        assert_eq!(diff, a.subtract(&b));
        assert_eq!(diff.to_string(), "[0..5) [10..12)");

        let mut c = a.clone();
        c |= &b;
        assert_eq!(c, union);
    }

    #[test]
    fn test_shift_clips_and_discards() {
        let mut set = SparseSet::new();
        set.include(2, 4).unwrap().include(6, 10).unwrap();
        set.shift(7);
        assert_eq!(set.ranges(), &[Range { begin: 0, end: 3 }]);
        set.shift(3);
        assert!(set.is_empty());
    }

    #[test]
    fn test_subset_and_invert() {
        let mut set = SparseSet::new();
        set.include(0, 10).unwrap().include(20, 30).unwrap();
        assert_eq!(set.subset(5, 25).to_string(), "[5..10) [20..25)");
        assert_eq!(set.invert(5, 25).to_string(), "[10..20)");
        assert_eq!(set.invert(40, 50).to_string(), "[40..50)");
        assert!(set.invert(0, 10).is_empty());
        assert!(set.covers(21, 30));
        assert!(!set.covers(9, 21));
    }

    #[test]
    fn test_marshal_roundtrip_and_capacity() {
        let mut set = SparseSet::new();
        set.include(1, 3).unwrap().include(8, 9).unwrap();

        let mut words = vec![0u64; SparseSet::marshalled_words(2)];
        set.marshal(&mut words).unwrap();
        assert_eq!(words, vec![2, 1, 3, 8, 9]);
        assert_eq!(SparseSet::unmarshal(&words).unwrap(), set);

        let mut small = vec![0u64; SparseSet::marshalled_words(1)];
        assert_eq!(
            set.marshal(&mut small).unwrap_err(),
            SparseSetError::CapacityExceeded {
                ranges: 2,
                capacity: 1
            }
        );
        assert!(SparseSet::unmarshal(&[2, 5, 4, 0, 0]).is_err());
        assert!(SparseSet::unmarshal(&[2, 1, 5, 4, 9]).is_err());
    }

    #[test]
    fn test_truncate_front_keeps_newest() {
        let mut set = SparseSet::new();
        set.include(0, 2).unwrap().include(4, 6).unwrap().include(8, 12).unwrap();
        assert_eq!(set.truncate_front(2), 2);
        assert_eq!(members(&set, 16), vec![4, 5, 8, 9, 10, 11]);
        assert_eq!(set.truncate_front(5), 0);
    }
}
