//! Fd-Range Set: a compact ordered set of file descriptor ranges, used
//! by the fork layer to express "keep these fds open across exec" and
//! "close everything else" without materializing a list of every
//! individual descriptor. `BTreeMap` is the natural backing store —
//! insertion, lookup and in-order iteration are all the operations this
//! type actually needs; a full self-balancing tree datatype buys nothing
//! extra in ordered associative form.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use crate::error::RuntimeError;

/// An inclusive range `[lo, hi]` of file descriptor numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FdRange {
    pub lo: i32,
    pub hi: i32,
}

impl FdRange {
    pub fn new(lo: i32, hi: i32) -> Self {
        assert!(lo <= hi, "empty or inverted fd range");
        Self { lo, hi }
    }

    pub fn single(fd: i32) -> Self {
        Self { lo: fd, hi: fd }
    }

    pub fn contains(&self, fd: i32) -> bool {
        fd >= self.lo && fd <= self.hi
    }

    /// True if the two ranges share at least one fd (the condition under
    /// which `insert` below rejects a range).
    fn overlaps(&self, other: &FdRange) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }

    /// True if the two ranges are disjoint but abut, i.e. merging them
    /// would produce one contiguous range.
    fn abuts(&self, other: &FdRange) -> bool {
        !self.overlaps(other)
            && (self.hi.saturating_add(1) == other.lo || other.hi.saturating_add(1) == self.lo)
    }
}

impl fmt::Display for FdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

/// An ordered set of disjoint, non-adjacent `FdRange`s. Adjacent or
/// overlapping ranges are merged on insert, so the set always holds the
/// minimal representation: inserting two touching ranges yields one range.
#[derive(Debug, Default, Clone)]
pub struct FdRangeSet {
    // keyed by `lo`, value is `hi`.
    ranges: BTreeMap<i32, i32>,
}

impl FdRangeSet {
    pub fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Ranges that start at or before `fd` — used to find the one
    /// candidate that could contain it.
    fn candidate_before(&self, fd: i32) -> Option<(i32, i32)> {
        self.ranges
            .range((Bound::Unbounded, Bound::Included(fd)))
            .next_back()
            .map(|(&lo, &hi)| (lo, hi))
    }

    pub fn contains(&self, fd: i32) -> bool {
        matches!(self.candidate_before(fd), Some((_, hi)) if hi >= fd)
    }

    /// Inserts `range`. Fails with [`RuntimeError::RangeExists`] if
    /// `range` shares even one fd with an existing element — including
    /// inserting the same range twice. A range that merely *abuts* an
    /// existing element (no shared fd, but contiguous) is merged into
    /// it instead of rejected.
    pub fn insert(&mut self, range: FdRange) -> Result<(), RuntimeError> {
        let nearby: Vec<(i32, i32)> = self
            .ranges
            .range((Bound::Unbounded, Bound::Included(range.hi.saturating_add(1))))
            .map(|(&l, &h)| (l, h))
            .filter(|(l, h)| *h >= range.lo.saturating_sub(1))
            .collect();

        if nearby
            .iter()
            .any(|(l, h)| FdRange::new(*l, *h).overlaps(&range))
        {
            return Err(RuntimeError::RangeExists(range));
        }

        let mut lo = range.lo;
        let mut hi = range.hi;

        for (l, h) in nearby {
            if FdRange::new(l, h).abuts(&range) {
                self.ranges.remove(&l);
                lo = lo.min(l);
                hi = hi.max(h);
            }
        }

        self.ranges.insert(lo, hi);
        Ok(())
    }

    /// Removes exactly the span covered by `range`, splitting any
    /// overlapping existing range at the boundary.
    pub fn remove(&mut self, range: FdRange) -> Result<(), RuntimeError> {
        if !self.covers(range) {
            return Err(RuntimeError::RangeMissing(range));
        }

        let overlapping: Vec<(i32, i32)> = self
            .ranges
            .range((Bound::Unbounded, Bound::Included(range.hi)))
            .map(|(&l, &h)| (l, h))
            .filter(|(l, h)| *h >= range.lo && *l <= range.hi)
            .collect();

        for (l, h) in overlapping {
            self.ranges.remove(&l);
            if l < range.lo {
                self.ranges.insert(l, range.lo - 1);
            }
            if h > range.hi {
                self.ranges.insert(range.hi + 1, h);
            }
        }

        Ok(())
    }

    /// True if every fd in `range` is present in the set.
    pub fn covers(&self, range: FdRange) -> bool {
        match self.candidate_before(range.lo) {
            Some((_, hi)) => hi >= range.hi,
            None => false,
        }
    }

    /// The complement of this set within `[0, limit]`, used by the fork
    /// layer to turn a "keep" whitelist into the set of fds to close.
    pub fn invert(&self, limit: i32) -> FdRangeSet {
        let mut out = FdRangeSet::new();
        let mut cursor = 0;

        for (&lo, &hi) in &self.ranges {
            if lo > cursor {
                out.insert(FdRange::new(cursor, lo - 1))
                    .expect("gaps derived from a disjoint set cannot overlap");
            }
            cursor = cursor.max(hi + 1);
        }

        if cursor <= limit {
            out.insert(FdRange::new(cursor, limit))
                .expect("trailing gap cannot overlap prior gaps");
        }

        out
    }

    pub fn iter(&self) -> impl Iterator<Item = FdRange> + '_ {
        self.ranges.iter().map(|(&lo, &hi)| FdRange::new(lo, hi))
    }

    /// Visits ranges in ascending order. `f`
    /// returns a C-style status per element: `0` to keep going, a
    /// positive value to stop after this element (counted), or a
    /// negative value to report a callback error. Returns `-1` if any
    /// call to `f` returned negative, otherwise the number of elements
    /// visited before stopping (or the full count, if `f` never asked
    /// to stop).
    pub fn visit(&self, mut f: impl FnMut(FdRange) -> i32) -> i32 {
        let mut visited = 0;
        for range in self.iter() {
            let status = f(range);
            visited += 1;
            if status < 0 {
                return -1;
            }
            if status > 0 {
                return visited;
            }
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touching_ranges_merge_on_insert() {
        let mut set = FdRangeSet::new();
        set.insert(FdRange::new(3, 5)).unwrap();
        set.insert(FdRange::new(6, 8)).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(3));
        assert!(set.contains(8));
    }

    #[test]
    fn disjoint_ranges_stay_separate() {
        let mut set = FdRangeSet::new();
        set.insert(FdRange::new(3, 5)).unwrap();
        set.insert(FdRange::new(10, 12)).unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set.contains(7));
    }

    #[test]
    fn inserting_an_overlapping_range_fails() {
        let mut set = FdRangeSet::new();
        set.insert(FdRange::new(3, 5)).unwrap();
        assert!(matches!(
            set.insert(FdRange::new(3, 5)),
            Err(RuntimeError::RangeExists(_))
        ));
        assert!(matches!(
            set.insert(FdRange::new(4, 9)),
            Err(RuntimeError::RangeExists(_))
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn removing_the_middle_splits_a_range() {
        let mut set = FdRangeSet::new();
        set.insert(FdRange::new(0, 10)).unwrap();
        set.remove(FdRange::new(4, 6)).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.contains(3));
        assert!(!set.contains(4));
        assert!(!set.contains(6));
        assert!(set.contains(7));
    }

    #[test]
    fn removing_an_uncovered_range_fails() {
        let mut set = FdRangeSet::new();
        set.insert(FdRange::new(0, 2)).unwrap();
        assert!(matches!(
            set.remove(FdRange::new(5, 6)),
            Err(RuntimeError::RangeMissing(_))
        ));
    }

    #[test]
    fn invert_yields_the_gaps() {
        let mut set = FdRangeSet::new();
        set.insert(FdRange::new(0, 2)).unwrap();
        set.insert(FdRange::new(5, 5)).unwrap();

        let inverted = set.invert(8);
        let ranges: Vec<FdRange> = inverted.iter().collect();
        assert_eq!(ranges, vec![FdRange::new(3, 4), FdRange::new(6, 8)]);
    }

    /// Insert `{[0,0],[2,2],[4,4]}`, visit with a
    /// callback expecting `0, 2, 4` in order that halts at `2`.
    #[test]
    fn visit_can_halt_early() {
        let mut set = FdRangeSet::new();
        set.insert(FdRange::single(0)).unwrap();
        set.insert(FdRange::single(2)).unwrap();
        set.insert(FdRange::single(4)).unwrap();

        let mut expected = [0, 2, 4].into_iter();
        let mut last_seen = None;
        let visited = set.visit(|range| {
            let want = expected.next().unwrap();
            assert_eq!(range, FdRange::single(want));
            last_seen = Some(want);
            if want == 2 {
                1
            } else {
                0
            }
        });

        assert_eq!(visited, 2);
        assert_eq!(last_seen, Some(2));
    }
}
