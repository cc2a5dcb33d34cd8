//! Acknowledgement ranges.
//!
//! # Overview
//!
//! A [`RangeSet`] is a set of message numbers kept as closed, ascending,
//! non-overlapping and non-adjacent [`Range`]s. Receivers use it for the
//! numbers they have accepted, senders for the numbers the peer has
//! acknowledged.
//!
//! # Text Format
//!
//! The set renders as a comma-separated list where each element is either a
//! single number or `low-high`:
//!
//! ```text
//! 1-5,7,9-12
//! ```
//!
//! Parsing is lenient about whitespace, order, overlap and adjacency, and
//! always normalizes, so `"3,1-2,2"` parses to the same set as `"1-3"`.
//!
//! # Example
//!
//! ```ignore
//! use courier::RangeSet;
//!
//! let mut acked: RangeSet = "1-3,5".parse()?;
//! assert!(acked.insert(4));
//! assert_eq!(acked.to_string(), "1-5");
//! assert!(!acked.insert(4)); // already present
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use thiserror::Error;

// =============================================================================
// Range
// =============================================================================

/// A closed interval of message numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Range {
    pub lower: u64,
    pub upper: u64,
}

impl Range {
    /// Create a range. Bounds given in the wrong order are swapped.
    pub fn new(a: u64, b: u64) -> Self {
        Self {
            lower: a.min(b),
            upper: a.max(b),
        }
    }

    /// A range holding exactly one number.
    pub fn single(n: u64) -> Self {
        Self { lower: n, upper: n }
    }

    pub fn contains(&self, n: u64) -> bool {
        self.lower <= n && n <= self.upper
    }

    /// Number of members, saturating at `u64::MAX` for the full range.
    pub fn size(&self) -> u64 {
        (self.upper - self.lower).saturating_add(1)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lower == self.upper {
            write!(f, "{}", self.lower)
        } else {
            write!(f, "{}-{}", self.lower, self.upper)
        }
    }
}

// =============================================================================
// Parse Error
// =============================================================================

/// Errors from parsing the range text format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeParseError {
    /// An element was not a non-negative integer.
    #[error("invalid message number {0:?}")]
    InvalidNumber(String),

    /// An element had a lower bound above its upper bound.
    #[error("range {0:?} has its lower bound above its upper bound")]
    Inverted(String),
}

// =============================================================================
// Range Set
// =============================================================================

/// A normalized set of message numbers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RangeSet {
    ranges: SmallVec<[Range; 4]>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no number is present.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether `n` is a member.
    pub fn contains(&self, n: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.upper < n);
        self.ranges.get(idx).is_some_and(|r| r.lower <= n)
    }

    /// Insert one number. Returns `false` if it was already present.
    pub fn insert(&mut self, n: u64) -> bool {
        self.insert_range(Range::single(n))
    }

    /// Insert every number of `range`, merging with neighbours.
    ///
    /// Returns `false` if the whole range was already present.
    pub fn insert_range(&mut self, range: Range) -> bool {
        // First stored range that overlaps or touches `range` on the left.
        let start = self
            .ranges
            .partition_point(|r| r.upper.saturating_add(1) < range.lower);
        // One past the last stored range that overlaps or touches it on the right.
        let end = self
            .ranges
            .partition_point(|r| r.lower <= range.upper.saturating_add(1));

        if start < end {
            let first = self.ranges[start];
            if first.lower <= range.lower && first.upper >= range.upper {
                return false;
            }
        }

        let mut merged = range;
        if start < end {
            merged.lower = merged.lower.min(self.ranges[start].lower);
            merged.upper = merged.upper.max(self.ranges[end - 1].upper);
        }
        self.ranges.drain(start..end);
        self.ranges.insert(start, merged);
        true
    }

    /// Insert every number of `other`. Returns `true` if anything was added.
    pub fn union(&mut self, other: &RangeSet) -> bool {
        let mut changed = false;
        for range in other.iter() {
            changed |= self.insert_range(*range);
        }
        changed
    }

    /// Whether a single stored range covers all of `range`.
    pub fn is_range_completed(&self, range: Range) -> bool {
        let idx = self.ranges.partition_point(|r| r.upper < range.lower);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.lower <= range.lower && r.upper >= range.upper)
    }

    /// Whether every number in `1..=upper` is present. Vacuously true for 0.
    pub fn covers_up_to(&self, upper: u64) -> bool {
        upper == 0 || self.is_range_completed(Range::new(1, upper))
    }

    /// Total number of members.
    pub fn count(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |total, r| total.saturating_add(r.size()))
    }

    /// Largest member.
    pub fn highest(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.upper)
    }

    /// Smallest member.
    pub fn lowest(&self) -> Option<u64> {
        self.ranges.first().map(|r| r.lower)
    }

    /// The stored ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.ranges.iter()
    }

    /// Every member in ascending order.
    pub fn numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|r| r.lower..=r.upper)
    }

    /// The missing sub-ranges of `lower..=upper`.
    pub fn gaps(&self, lower: u64, upper: u64) -> Vec<Range> {
        let mut gaps = Vec::new();
        if lower > upper {
            return gaps;
        }
        let mut cursor = lower;
        for r in self.ranges.iter() {
            if r.upper < cursor {
                continue;
            }
            if r.lower > upper {
                break;
            }
            if r.lower > cursor {
                gaps.push(Range::new(cursor, r.lower - 1));
            }
            if r.upper >= upper {
                return gaps;
            }
            cursor = r.upper + 1;
        }
        gaps.push(Range::new(cursor, upper));
        gaps
    }

    /// Members of `self` that are not members of `other`.
    pub fn difference(&self, other: &RangeSet) -> RangeSet {
        self.ranges
            .iter()
            .flat_map(|r| other.gaps(r.lower, r.upper))
            .collect()
    }

    /// Numbers in `1..=upper` that are not members.
    pub fn missing_up_to(&self, upper: u64) -> Vec<u64> {
        if upper == 0 {
            return Vec::new();
        }
        self.gaps(1, upper)
            .into_iter()
            .flat_map(|r| r.lower..=r.upper)
            .collect()
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}

impl FromStr for RangeSet {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = RangeSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let range = match part.split_once('-') {
                Some((low, high)) => {
                    let low = parse_number(low)?;
                    let high = parse_number(high)?;
                    if low > high {
                        return Err(RangeParseError::Inverted(part.to_string()));
                    }
                    Range::new(low, high)
                }
                None => Range::single(parse_number(part)?),
            };
            set.insert_range(range);
        }
        Ok(set)
    }
}

fn parse_number(s: &str) -> Result<u64, RangeParseError> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| RangeParseError::InvalidNumber(s.trim().to_string()))
}

impl FromIterator<u64> for RangeSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<u64> for RangeSet {
    fn extend<I: IntoIterator<Item = u64>>(&mut self, iter: I) {
        for n in iter {
            self.insert(n);
        }
    }
}

impl FromIterator<Range> for RangeSet {
    fn from_iter<I: IntoIterator<Item = Range>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert_range(range);
        }
        set
    }
}

// Stored as the text form so snapshots stay readable.
impl Serialize for RangeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RangeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_neighbours() {
        let mut set = RangeSet::new();
        assert!(set.insert(1));
        assert!(set.insert(3));
        assert_eq!(set.to_string(), "1,3");
        assert!(set.insert(2));
        assert_eq!(set.to_string(), "1-3");
        assert_eq!(set.iter().count(), 1);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut set: RangeSet = [1, 2, 3, 7].into_iter().collect();
        let before = set.clone();
        assert!(!set.insert(2));
        assert!(!set.insert(7));
        assert_eq!(set, before);
    }

    #[test]
    fn test_insert_range_spanning_several() {
        let mut set: RangeSet = "1-2,5,8-9,20".parse().unwrap();
        assert!(set.insert_range(Range::new(3, 10)));
        assert_eq!(set.to_string(), "1-10,20");
        assert!(!set.insert_range(Range::new(4, 6)));
    }

    #[test]
    fn test_contains_and_completed() {
        let set: RangeSet = "1-5,7,9-12".parse().unwrap();
        assert!(set.contains(1));
        assert!(set.contains(5));
        assert!(!set.contains(6));
        assert!(set.contains(7));
        assert!(!set.contains(13));
        assert!(set.is_range_completed(Range::new(2, 4)));
        assert!(set.is_range_completed(Range::new(9, 12)));
        assert!(!set.is_range_completed(Range::new(4, 7)));
        assert!(set.covers_up_to(5));
        assert!(!set.covers_up_to(7));
        assert!(set.covers_up_to(0));
    }

    #[test]
    fn test_text_round_trip() {
        for text in ["", "1", "1-5,7,9-12", "3-4,100", "18446744073709551615"] {
            let set: RangeSet = text.parse().unwrap();
            assert_eq!(set.to_string(), text);
        }
    }

    #[test]
    fn test_parse_normalizes() {
        let set: RangeSet = " 9-12, 1-3 ,4,2,7 ".parse().unwrap();
        assert_eq!(set.to_string(), "1-4,7,9-12");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "1,x".parse::<RangeSet>(),
            Err(RangeParseError::InvalidNumber("x".into()))
        );
        assert_eq!(
            "5-2".parse::<RangeSet>(),
            Err(RangeParseError::Inverted("5-2".into()))
        );
        assert!("-3".parse::<RangeSet>().is_err());
    }

    #[test]
    fn test_count_highest_gaps() {
        let set: RangeSet = "2-4,7,9-10".parse().unwrap();
        assert_eq!(set.count(), 6);
        assert_eq!(set.highest(), Some(10));
        assert_eq!(set.lowest(), Some(2));
        assert_eq!(
            set.gaps(1, 12),
            vec![Range::new(1, 1), Range::new(5, 6), Range::new(8, 8), Range::new(11, 12)]
        );
        assert_eq!(set.gaps(3, 4), Vec::<Range>::new());
        assert_eq!(set.missing_up_to(8), vec![1, 5, 6, 8]);
        assert_eq!(
            set.numbers().collect::<Vec<_>>(),
            vec![2, 3, 4, 7, 9, 10]
        );
    }

    #[test]
    fn test_union() {
        let mut a: RangeSet = "1-3".parse().unwrap();
        let b: RangeSet = "4,6-8".parse().unwrap();
        assert!(a.union(&b));
        assert_eq!(a.to_string(), "1-4,6-8");
        assert!(!a.union(&b));
    }

    #[test]
    fn test_insert_at_numeric_limit() {
        let mut set = RangeSet::new();
        set.insert(u64::MAX);
        set.insert(u64::MAX - 1);
        assert_eq!(set.count(), 2);
        assert!(set.contains(u64::MAX));
    }

    #[test]
    fn test_difference_works_on_ranges() {
        let acked: RangeSet = "1-1000000,2000000-3000000".parse().unwrap();
        let incoming: RangeSet = "5-10,999990-2000005,4000000".parse().unwrap();
        let fresh = incoming.difference(&acked);
        assert_eq!(fresh.to_string(), "1000001-1999999,4000000");
        assert_eq!(fresh.count(), 1_000_000);
        assert!(acked.difference(&acked).is_empty());
    }

    #[test]
    fn test_count_saturates_on_full_range() {
        let full: RangeSet = "0-18446744073709551615".parse().unwrap();
        assert_eq!(full.count(), u64::MAX);
        assert_eq!(Range::new(0, u64::MAX).size(), u64::MAX);

        let split: RangeSet = "0-5,7-18446744073709551615".parse().unwrap();
        assert_eq!(split.count(), u64::MAX);
        assert_eq!(split.gaps(0, u64::MAX), vec![Range::single(6)]);
    }

    #[test]
    fn test_serde_uses_text_form() {
        let set: RangeSet = "1-3,8".parse().unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"1-3,8\"");
        let back: RangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_random_permutation_converges() {
        let mut rng = fastrand::Rng::with_seed(7);
        let mut numbers: Vec<u64> = (1..=200).filter(|n| n % 17 != 0).collect();
        rng.shuffle(&mut numbers);

        let mut set = RangeSet::new();
        for n in &numbers {
            assert!(set.insert(*n));
        }
        assert_eq!(set.count(), numbers.len() as u64);
        assert_eq!(set.missing_up_to(200).len(), 200 - numbers.len());
        let reparsed: RangeSet = set.to_string().parse().unwrap();
        assert_eq!(reparsed, set);
    }
}
