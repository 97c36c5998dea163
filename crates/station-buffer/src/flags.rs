//! Per-board validity bookkeeping.
//!
//! A board's flags track three absolute sample indices:
//!
//! - `horizon`: end of the newest committed window
//! - `reserved`: end of the newest window handed to the writer, `>= horizon`
//! - `base`: origin of the offsets stored in the range set
//!
//! Slot `t % N` can only hold sample `t` when `t >= reserved - N` (the floor),
//! so a sample is valid when it is marked, at or above the floor, and below the
//! horizon. Moving the floor up is all eviction takes; marks below it are
//! dropped lazily by re-basing.

use station_core::SparseSet;

use crate::error::{BufferError, Result};

/// Snapshot of one board's validity state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardFlags {
    pub(crate) base: i64,
    pub(crate) horizon: Option<i64>,
    pub(crate) reserved: Option<i64>,
    pub(crate) commits: u64,
    pub(crate) valid: SparseSet,
}

impl BoardFlags {
    /// End of the newest committed window.
    pub fn horizon(&self) -> Option<i64> {
        self.horizon
    }

    /// End of the newest window handed out for writing.
    pub fn reserved(&self) -> Option<i64> {
        self.reserved
    }

    /// Number of commits so far.
    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// Absolute sample that offset 0 of [`valid`](Self::valid) refers to.
    pub fn base(&self) -> i64 {
        self.base
    }

    /// Marked offsets relative to [`base`](Self::base).
    pub fn valid(&self) -> &SparseSet {
        &self.valid
    }

    /// Oldest sample that can still be valid in a buffer of `capacity` samples.
    pub fn floor(&self, capacity: u64) -> Option<i64> {
        self.reserved
            .map(|reserved| reserved.saturating_sub(capacity as i64))
    }

    /// Whether any of `[start, ..)` has fallen below the floor.
    pub fn is_evicted(&self, start: i64, capacity: u64) -> bool {
        self.floor(capacity).is_some_and(|floor| start < floor)
    }

    /// Offsets of `[start, start + length)`, relative to `start`, that are not valid.
    pub fn missing(&self, start: i64, length: u64, capacity: u64) -> SparseSet {
        let mut missing = SparseSet::from_range(0, length);
        let Some(horizon) = self.horizon else {
            return missing;
        };
        let floor = self.floor(capacity).unwrap_or(i64::MIN);

        let end = start.saturating_add(length as i64);
        let begin = start.max(floor).max(self.base);
        let end = end.min(horizon);
        if begin >= end {
            return missing;
        }

        let present = self
            .valid
            .subset((begin - self.base) as u64, (end - self.base) as u64);
        let delta = self.base - start;
        for range in present.ranges() {
            let b = (range.begin as i64 + delta) as u64;
            let e = (range.end as i64 + delta) as u64;
            // subset ranges are never empty
            let _ = missing.exclude(b, e);
        }
        missing
    }

    /// Whether all of `[start, start + length)` is valid.
    pub fn is_valid(&self, start: i64, length: u64, capacity: u64) -> bool {
        self.missing(start, length, capacity).is_empty()
    }

    /// Hand `[start, end)` to the writer: raise the floor past whatever the
    /// window overwrites and unmark the window until it is committed.
    ///
    /// Unmarking can split a range; the oldest ranges are dropped to stay
    /// within `max_ranges`, and the number of samples unmarked that way is
    /// returned.
    pub(crate) fn reserve(
        &mut self,
        start: i64,
        end: i64,
        capacity: u64,
        max_ranges: usize,
    ) -> Result<u64> {
        debug_assert!(start < end && (end - start) as u64 <= capacity);
        if let Some(floor) = self.floor(capacity) {
            if start < floor {
                return Err(BufferError::TooOld { start, floor });
            }
        }

        match self.reserved {
            Some(reserved) => self.reserved = Some(reserved.max(end)),
            None => {
                self.reserved = Some(end);
                self.base = end.saturating_sub(capacity as i64);
            }
        }
        self.rebase(capacity);

        let offset = (start - self.base) as u64;
        self.valid
            .exclude(offset, offset + (end - start) as u64)?;
        Ok(self.valid.truncate_front(max_ranges))
    }

    /// Mark `[start, end)` valid and move the horizon.
    ///
    /// Returns the number of samples unmarked to respect `max_ranges`.
    pub(crate) fn commit(
        &mut self,
        start: i64,
        end: i64,
        capacity: u64,
        max_ranges: usize,
    ) -> Result<u64> {
        let reserved = match self.reserved {
            Some(reserved) if end <= reserved => reserved,
            _ => return Err(BufferError::NotReserved { start, end }),
        };
        let floor = reserved.saturating_sub(capacity as i64);
        if start < floor {
            return Err(BufferError::TooOld { start, floor });
        }

        self.horizon = Some(self.horizon.map_or(end, |horizon| horizon.max(end)));
        self.rebase(capacity);

        let offset = (start - self.base) as u64;
        self.valid.include(offset, offset + (end - start) as u64)?;
        let dropped = self.valid.truncate_front(max_ranges);
        self.commits += 1;
        Ok(dropped)
    }

    fn rebase(&mut self, capacity: u64) {
        let Some(floor) = self.floor(capacity) else {
            return;
        };
        if floor > self.base {
            self.valid.shift((floor - self.base) as u64);
            self.base = floor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: u64 = 100;

    fn committed(windows: &[(i64, i64)]) -> BoardFlags {
        let mut flags = BoardFlags::default();
        for &(start, end) in windows {
            flags.reserve(start, end, N, 16).unwrap();
            flags.commit(start, end, N, 16).unwrap();
        }
        flags
    }

    #[test]
    fn test_empty_board_has_nothing_valid() {
        let flags = BoardFlags::default();
        assert_eq!(flags.missing(0, 10, N), SparseSet::from_range(0, 10));
        assert!(!flags.is_evicted(-1_000_000, N));
    }

    #[test]
    fn test_gap_is_reported_relative_to_start() {
        let flags = committed(&[(1000, 1010), (1020, 1030)]);
        assert_eq!(flags.missing(1005, 20, N).to_string(), "[5..15)");
        // beyond the horizon is missing too
        assert_eq!(flags.missing(1025, 10, N).to_string(), "[5..10)");
    }

    #[test]
    fn test_floor_evicts_old_marks() {
        let flags = committed(&[(1000, 1050), (1050, 1120)]);
        assert_eq!(flags.floor(N), Some(1020));
        assert!(flags.is_evicted(1000, N));
        assert_eq!(flags.missing(1000, 40, N).to_string(), "[0..20)");
        assert!(flags.is_valid(1020, 100, N));
        assert_eq!(flags.base(), 1020);
    }

    #[test]
    fn test_reservation_unmarks_window() {
        let mut flags = committed(&[(0, 50)]);
        flags.reserve(20, 30, N, 16).unwrap();
        assert_eq!(flags.missing(0, 50, N).to_string(), "[20..30)");
        flags.commit(20, 30, N, 16).unwrap();
        assert!(flags.is_valid(0, 50, N));
    }

    #[test]
    fn test_too_old_and_unreserved_rejected() {
        let mut flags = committed(&[(0, 100), (100, 200)]);
        assert!(matches!(
            flags.reserve(50, 60, N, 16),
            Err(BufferError::TooOld { start: 50, floor: 100 })
        ));
        assert!(matches!(
            flags.commit(190, 210, N, 16),
            Err(BufferError::NotReserved { .. })
        ));
    }

    #[test]
    fn test_range_cap_drops_oldest() {
        let mut flags = BoardFlags::default();
        for i in 0..6 {
            let start = i * 10;
            flags.reserve(start, start + 5, N, 4).unwrap();
            flags.commit(start, start + 5, N, 4).unwrap();
        }
        assert_eq!(flags.valid().ranges().len(), 4);
        assert!(!flags.is_valid(0, 5, N));
        assert!(!flags.is_valid(10, 5, N));
        assert!(flags.is_valid(20, 5, N));
        assert!(flags.is_valid(50, 5, N));
    }

    #[test]
    fn test_reservation_split_respects_range_cap() {
        let mut flags = BoardFlags::default();
        for (start, end) in [(0, 10), (20, 30)] {
            flags.reserve(start, end, N, 2).unwrap();
            flags.commit(start, end, N, 2).unwrap();
        }
        // splitting [0..10) would make three ranges
        assert_eq!(flags.reserve(3, 5, N, 2).unwrap(), 3);
        assert_eq!(flags.valid().ranges().len(), 2);
        assert!(!flags.is_valid(0, 3, N));
        assert!(flags.is_valid(5, 5, N));
        assert!(flags.is_valid(20, 10, N));
    }
}
