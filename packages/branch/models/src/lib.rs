#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Branch code window and configuration entry types.

use chrono::NaiveDate;
use pos_sync_interval::DateInterval;
use serde::{Deserialize, Serialize};

/// The period during which a provider code was the correct address for a
/// logical branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeWindow {
    /// Provider-side subsidiary code (e.g., `"8777"`).
    pub code: String,
    /// First day the code is valid (inclusive).
    pub valid_from: NaiveDate,
    /// Last day the code is valid (inclusive). `None` means still current.
    pub valid_to: Option<NaiveDate>,
    /// Configuration key this window was loaded from (e.g., `"Kavia_OLD"`).
    pub source_key: String,
}

impl CodeWindow {
    /// Whether the window covers `day`.
    #[must_use]
    pub fn covers(&self, day: NaiveDate) -> bool {
        self.valid_from <= day && self.valid_to.is_none_or(|to| day <= to)
    }

    /// The part of `range` during which this window is valid, if any.
    #[must_use]
    pub fn overlap(&self, range: &DateInterval) -> Option<DateInterval> {
        let start = self.valid_from.max(range.start());
        let end = self.valid_to.map_or(range.end(), |to| to.min(range.end()));
        DateInterval::new(start, end).ok()
    }

    /// Returns a copy of this window with its bounds clamped to `range`, or
    /// `None` if the two do not intersect.
    #[must_use]
    pub fn clamped_to(&self, range: &DateInterval) -> Option<Self> {
        self.overlap(range).map(|span| Self {
            code: self.code.clone(),
            valid_from: span.start(),
            valid_to: Some(span.end()),
            source_key: self.source_key.clone(),
        })
    }

    /// Whether the window was configured without a `valid_from`.
    #[must_use]
    pub fn starts_unbounded(&self) -> bool {
        self.valid_from == NaiveDate::MIN
    }

    /// Whether two windows share at least one day.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let starts_before_other_ends = other.valid_to.is_none_or(|to| self.valid_from <= to);
        let ends_after_other_starts = self.valid_to.is_none_or(|to| other.valid_from <= to);
        starts_before_other_ends && ends_after_other_starts
    }
}

/// A single entry from the branch configuration file after validation.
///
/// The file maps a key to either a bare code string or an object carrying
/// validity dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BranchEntry {
    /// `"Kavia": "8777"`: the code is valid for all dates.
    Code(String),
    /// `"Kavia_OLD": {"code": "6161", "valid_from": "...", "valid_to": "..."}`.
    Window {
        /// Provider code.
        code: String,
        /// First valid day; unbounded when absent.
        #[serde(default)]
        valid_from: Option<NaiveDate>,
        /// Last valid day; open-ended when absent or null.
        #[serde(default)]
        valid_to: Option<NaiveDate>,
    },
}

impl BranchEntry {
    /// Converts the entry into a [`CodeWindow`] tagged with its source key.
    #[must_use]
    pub fn into_window(self, source_key: &str) -> CodeWindow {
        match self {
            Self::Code(code) => CodeWindow {
                code,
                valid_from: NaiveDate::MIN,
                valid_to: None,
                source_key: source_key.to_owned(),
            },
            Self::Window {
                code,
                valid_from,
                valid_to,
            } => CodeWindow {
                code,
                valid_from: valid_from.unwrap_or(NaiveDate::MIN),
                valid_to,
                source_key: source_key.to_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        pos_sync_interval::parse_date(s).unwrap()
    }

    fn window(code: &str, from: &str, to: Option<&str>) -> CodeWindow {
        CodeWindow {
            code: code.to_owned(),
            valid_from: d(from),
            valid_to: to.map(d),
            source_key: code.to_owned(),
        }
    }

    #[test]
    fn open_window_covers_future_dates() {
        let w = window("8777", "2024-02-21", None);
        assert!(w.covers(d("2030-01-01")));
        assert!(!w.covers(d("2024-02-20")));
    }

    #[test]
    fn clamps_open_window_to_range() {
        let w = window("8777", "2024-02-21", None);
        let range = DateInterval::parse("2024-01-01", "2024-03-31").unwrap();
        let clamped = w.clamped_to(&range).unwrap();
        assert_eq!(clamped.valid_from, d("2024-02-21"));
        assert_eq!(clamped.valid_to, Some(d("2024-03-31")));
    }

    #[test]
    fn clamp_outside_range_is_none() {
        let w = window("6161", "2022-11-01", Some("2024-02-20"));
        let range = DateInterval::parse("2024-03-01", "2024-03-31").unwrap();
        assert!(w.clamped_to(&range).is_none());
    }

    #[test]
    fn detects_overlapping_windows() {
        let old = window("6161", "2022-11-01", Some("2024-02-20"));
        let new = window("8777", "2024-02-21", None);
        let clash = window("9999", "2024-02-20", None);
        assert!(!old.overlaps(&new));
        assert!(old.overlaps(&clash));
        assert!(new.overlaps(&clash));
    }

    #[test]
    fn bare_code_entry_is_unbounded() {
        let entry: BranchEntry = serde_json::from_str("\"6190\"").unwrap();
        let w = entry.into_window("QIN");
        assert_eq!(w.valid_from, NaiveDate::MIN);
        assert_eq!(w.valid_to, None);
        assert!(w.covers(d("1999-01-01")));
    }
}
