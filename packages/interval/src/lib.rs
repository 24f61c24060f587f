#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Closed calendar-date intervals and the set operations the sync engine
//! needs to decide what still has to be downloaded.
//!
//! All intervals are inclusive on both ends. Two intervals that merely touch
//! (`a.end + 1 day == b.start`) are treated as contiguous and merge into one.

use std::fmt;

use chrono::NaiveDate;

/// Date format used for partition names and ledger records.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Errors produced when constructing or splitting intervals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    /// The start date falls after the end date.
    #[error("interval start {start} is after end {end}")]
    Inverted {
        /// Requested start date.
        start: NaiveDate,
        /// Requested end date.
        end: NaiveDate,
    },

    /// A chunk size below one day was requested.
    #[error("chunk size must be at least 1 day, got {0}")]
    InvalidChunkSize(u32),

    /// A date string was not in `YYYY-MM-DD` format.
    #[error("invalid date '{input}': expected YYYY-MM-DD")]
    InvalidDate {
        /// The rejected input.
        input: String,
    },
}

/// A closed, inclusive range of calendar dates with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateInterval {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateInterval {
    /// Creates an interval, rejecting `start > end`.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::Inverted`] if `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, IntervalError> {
        if start > end {
            return Err(IntervalError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// Creates a single-day interval.
    #[must_use]
    pub const fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// Parses two `YYYY-MM-DD` strings into an interval.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError`] if either date is malformed or the range is
    /// inverted.
    pub fn parse(start: &str, end: &str) -> Result<Self, IntervalError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    /// First day of the interval.
    #[must_use]
    pub const fn start(&self) -> NaiveDate {
        self.start
    }

    /// Last day of the interval.
    #[must_use]
    pub const fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of days covered, counting both ends.
    #[must_use]
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Whether `day` lies within the interval.
    #[must_use]
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// Whether `other` lies entirely within this interval.
    #[must_use]
    pub fn contains_interval(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The overlapping part of two intervals, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(Self { start, end })
    }
}

impl fmt::Display for DateInterval {
    /// Formats as `YYYY-MM-DD_YYYY-MM-DD`, the partition directory name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

/// Parses a `YYYY-MM-DD` date string.
///
/// # Errors
///
/// Returns [`IntervalError::InvalidDate`] if the string is not a valid date.
pub fn parse_date(s: &str) -> Result<NaiveDate, IntervalError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map_err(|_| IntervalError::InvalidDate {
        input: s.to_owned(),
    })
}

/// Merges overlapping or touching intervals into a minimal, ascending,
/// non-overlapping list.
#[must_use]
pub fn merge(intervals: &[DateInterval]) -> Vec<DateInterval> {
    let mut sorted = intervals.to_vec();
    sorted.sort_unstable();

    let mut merged: Vec<DateInterval> = Vec::with_capacity(sorted.len());

    for next in sorted {
        match merged.last_mut() {
            Some(current) if touches(current.end, next.start) => {
                if next.end > current.end {
                    current.end = next.end;
                }
            }
            _ => merged.push(next),
        }
    }

    merged
}

/// Returns the ascending sub-intervals of `target` not covered by any
/// interval in `covered`.
#[must_use]
pub fn subtract(target: DateInterval, covered: &[DateInterval]) -> Vec<DateInterval> {
    if covered.is_empty() {
        return vec![target];
    }

    let mut gaps = Vec::new();
    // `None` once the cursor has run past `NaiveDate::MAX`.
    let mut cursor = Some(target.start);

    for block in merge(covered) {
        let Some(cur) = cursor else {
            break;
        };
        if block.end < cur {
            continue;
        }
        if block.start > target.end {
            break;
        }
        if block.start > cur
            && let Some(before) = block.start.pred_opt()
        {
            gaps.push(DateInterval {
                start: cur,
                end: before.min(target.end),
            });
        }
        cursor = block.end.succ_opt().map(|next| next.max(cur));
        if cursor.is_none_or(|next| next > target.end) {
            cursor = None;
            break;
        }
    }

    if let Some(cur) = cursor
        && cur <= target.end
    {
        gaps.push(DateInterval {
            start: cur,
            end: target.end,
        });
    }

    gaps
}

/// Splits `interval` into consecutive pieces of at most `max_days` days.
///
/// The pieces are ascending, pairwise disjoint, and their union is exactly
/// `interval`. Only the last piece may be shorter than `max_days`.
///
/// # Errors
///
/// Returns [`IntervalError::InvalidChunkSize`] if `max_days` is zero.
pub fn chunk(interval: DateInterval, max_days: u32) -> Result<Vec<DateInterval>, IntervalError> {
    if max_days < 1 {
        return Err(IntervalError::InvalidChunkSize(max_days));
    }

    let span = chrono::Days::new(u64::from(max_days - 1));
    let mut chunks = Vec::new();
    let mut cur = interval.start;

    loop {
        let end = cur
            .checked_add_days(span)
            .map_or(interval.end, |d| d.min(interval.end));
        chunks.push(DateInterval { start: cur, end });

        match end.succ_opt() {
            Some(next) if end < interval.end => cur = next,
            _ => break,
        }
    }

    Ok(chunks)
}

/// Whether `target` lies entirely within a single merged block of
/// `covered`.
#[must_use]
pub fn is_covered(target: &DateInterval, covered: &[DateInterval]) -> bool {
    merge(covered)
        .iter()
        .any(|block| block.contains_interval(target))
}

/// `true` if an interval ending on `end` overlaps or abuts one starting on
/// `start`.
fn touches(end: NaiveDate, start: NaiveDate) -> bool {
    end.succ_opt().is_none_or(|next| start <= next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn iv(start: &str, end: &str) -> DateInterval {
        DateInterval::parse(start, end).unwrap()
    }

    #[test]
    fn rejects_inverted_interval() {
        let err = DateInterval::new(d("2025-01-02"), d("2025-01-01")).unwrap_err();
        assert!(matches!(err, IntervalError::Inverted { .. }));
    }

    #[test]
    fn rejects_malformed_date() {
        assert!(matches!(
            parse_date("2025/01/01"),
            Err(IntervalError::InvalidDate { .. })
        ));
    }

    #[test]
    fn displays_as_partition_name() {
        assert_eq!(
            iv("2025-01-01", "2025-01-31").to_string(),
            "2025-01-01_2025-01-31"
        );
    }

    #[test]
    fn counts_days_inclusively() {
        assert_eq!(DateInterval::single(d("2025-03-01")).days(), 1);
        assert_eq!(iv("2024-02-01", "2024-02-29").days(), 29);
    }

    #[test]
    fn merge_of_empty_is_empty() {
        assert!(merge(&[]).is_empty());
    }

    #[test]
    fn merges_overlapping_intervals() {
        let merged = merge(&[iv("2025-01-04", "2025-01-08"), iv("2025-01-01", "2025-01-05")]);
        assert_eq!(merged, vec![iv("2025-01-01", "2025-01-08")]);
    }

    #[test]
    fn merges_touching_but_not_separated_intervals() {
        let merged = merge(&[
            iv("2025-01-01", "2025-01-05"),
            iv("2025-01-06", "2025-01-10"),
            iv("2025-01-12", "2025-01-15"),
        ]);
        assert_eq!(
            merged,
            vec![iv("2025-01-01", "2025-01-10"), iv("2025-01-12", "2025-01-15")]
        );
    }

    #[test]
    fn merge_keeps_contained_interval_inside_outer() {
        let merged = merge(&[iv("2025-01-01", "2025-01-31"), iv("2025-01-10", "2025-01-12")]);
        assert_eq!(merged, vec![iv("2025-01-01", "2025-01-31")]);
    }

    #[test]
    fn merge_is_idempotent() {
        let samples = vec![
            vec![],
            vec![iv("2025-01-01", "2025-01-01")],
            vec![
                iv("2025-02-01", "2025-02-10"),
                iv("2025-01-01", "2025-01-03"),
                iv("2025-01-04", "2025-01-04"),
                iv("2025-02-05", "2025-03-01"),
                iv("2024-12-25", "2024-12-26"),
            ],
        ];
        for sample in samples {
            let once = merge(&sample);
            assert_eq!(merge(&once), once);
        }
    }

    #[test]
    fn subtract_leaves_trailing_gap() {
        let gaps = subtract(iv("2025-01-01", "2025-01-20"), &[iv("2025-01-01", "2025-01-10")]);
        assert_eq!(gaps, vec![iv("2025-01-11", "2025-01-20")]);
    }

    #[test]
    fn subtract_single_day_without_coverage() {
        let target = DateInterval::single(d("2025-03-01"));
        assert_eq!(subtract(target, &[]), vec![target]);
        assert_eq!(chunk(target, 180).unwrap(), vec![target]);
    }

    #[test]
    fn subtract_returns_inner_gaps() {
        let gaps = subtract(
            iv("2023-01-01", "2023-01-31"),
            &[iv("2023-01-20", "2023-01-25"), iv("2023-01-05", "2023-01-10")],
        );
        assert_eq!(
            gaps,
            vec![
                iv("2023-01-01", "2023-01-04"),
                iv("2023-01-11", "2023-01-19"),
                iv("2023-01-26", "2023-01-31"),
            ]
        );
    }

    #[test]
    fn subtract_fully_covered_is_empty() {
        let gaps = subtract(
            iv("2025-01-05", "2025-01-10"),
            &[iv("2025-01-01", "2025-01-07"), iv("2025-01-08", "2025-01-31")],
        );
        assert!(gaps.is_empty());
    }

    #[test]
    fn subtract_ignores_coverage_outside_target() {
        let target = iv("2025-02-01", "2025-02-28");
        let gaps = subtract(
            target,
            &[iv("2025-01-01", "2025-01-31"), iv("2025-03-01", "2025-03-31")],
        );
        assert_eq!(gaps, vec![target]);
    }

    #[test]
    fn subtract_partitions_target_exactly() {
        let target = iv("2024-12-20", "2025-02-10");
        let covered = vec![
            iv("2024-12-01", "2024-12-22"),
            iv("2025-01-05", "2025-01-06"),
            iv("2025-01-06", "2025-01-20"),
            iv("2025-02-09", "2025-03-01"),
        ];
        let gaps = subtract(target, &covered);
        let merged = merge(&covered);

        let mut day = target.start();
        while day <= target.end() {
            let in_gap = gaps.iter().filter(|g| g.contains(day)).count();
            let in_cover = merged.iter().any(|c| c.contains(day));
            assert!(in_gap <= 1, "{day} in more than one gap");
            assert_ne!(in_gap == 1, in_cover, "{day} must be in exactly one side");
            day = day.succ_opt().unwrap();
        }
        for g in &gaps {
            assert!(target.contains_interval(g));
        }
    }

    #[test]
    fn chunks_range_into_bounded_pieces() {
        let chunks = chunk(iv("2023-01-01", "2023-01-05"), 2).unwrap();
        assert_eq!(
            chunks,
            vec![
                iv("2023-01-01", "2023-01-02"),
                iv("2023-01-03", "2023-01-04"),
                iv("2023-01-05", "2023-01-05"),
            ]
        );
    }

    #[test]
    fn chunk_union_equals_input() {
        let interval = iv("2022-11-01", "2024-02-20");
        for max_days in [1, 7, 30, 180, 365, 10_000] {
            let chunks = chunk(interval, max_days).unwrap();
            assert_eq!(chunks.first().unwrap().start(), interval.start());
            assert_eq!(chunks.last().unwrap().end(), interval.end());
            for pair in chunks.windows(2) {
                assert_eq!(pair[0].end().succ_opt().unwrap(), pair[1].start());
            }
            for c in &chunks {
                assert!(c.days() <= i64::from(max_days));
            }
            let total: i64 = chunks.iter().map(DateInterval::days).sum();
            assert_eq!(total, interval.days());
        }
    }

    #[test]
    fn chunk_rejects_zero_size() {
        assert_eq!(
            chunk(iv("2025-01-01", "2025-01-02"), 0),
            Err(IntervalError::InvalidChunkSize(0))
        );
    }

    #[test]
    fn coverage_check_requires_one_containing_block() {
        let covered = vec![iv("2023-01-01", "2023-01-10"), iv("2023-01-11", "2023-01-15")];
        assert!(is_covered(&iv("2023-01-05", "2023-01-12"), &covered));
        assert!(!is_covered(&iv("2023-01-05", "2023-01-16"), &covered));
        assert!(!is_covered(&iv("2023-01-05", "2023-01-06"), &[]));
    }

    #[test]
    fn intersection_clamps_to_overlap() {
        let a = iv("2024-01-01", "2024-03-31");
        let b = iv("2024-03-01", "2024-06-30");
        assert_eq!(a.intersection(&b), Some(iv("2024-03-01", "2024-03-31")));
        assert_eq!(a.intersection(&iv("2024-04-01", "2024-04-02")), None);
    }
}
