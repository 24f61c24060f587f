#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! On-disk coverage discovery.
//!
//! Downloaded reports are laid out as
//! `<root>/<branch>/<code>/<start>_<end>/<file>`. The partition directory
//! name is the only record of which days a file covers, so coverage is
//! recomputed from directory names on every run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use pos_sync_interval::DateInterval;
use regex::Regex;

static PARTITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})_(\d{4}-\d{2}-\d{2})$").unwrap_or_else(|_| unreachable!())
});

/// Parses a partition directory name of the form `YYYY-MM-DD_YYYY-MM-DD`.
///
/// Returns `None` for anything else, including impossible dates and
/// inverted ranges.
#[must_use]
pub fn parse_partition_name(name: &str) -> Option<DateInterval> {
    let caps = PARTITION_RE.captures(name)?;
    DateInterval::parse(&caps[1], &caps[2]).ok()
}

/// Path of the partition directory for `interval`.
#[must_use]
pub fn partition_dir(root: &Path, branch: &str, code: &str, interval: &DateInterval) -> PathBuf {
    root.join(branch).join(code).join(interval.to_string())
}

/// Intervals stored under a single `<root>/<branch>/<code>` directory,
/// unmerged and in no particular order.
///
/// A missing directory yields no coverage. Partition directories that hold
/// no regular file are ignored.
#[must_use]
pub fn scan_code_dir(dir: &Path) -> Vec<DateInterval> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut found = Vec::new();

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_hidden(&name) {
            continue;
        }

        let Some(interval) = parse_partition_name(&name) else {
            log::warn!("Skipping unrecognized partition directory {}", path.display());
            continue;
        };

        if !has_regular_file(&path) {
            log::debug!("Ignoring empty partition {}", path.display());
            continue;
        }

        found.push(interval);
    }

    found
}

/// Coverage for `code` across every branch directory under `root`.
///
/// Looking across branches keeps coverage stable when a branch is renamed
/// in configuration but keeps its provider code.
#[must_use]
pub fn scan_code(root: &Path, code: &str) -> Vec<DateInterval> {
    let mut found = Vec::new();

    for branch_dir in subdirs(root) {
        let code_dir = branch_dir.join(code);
        if code_dir.is_dir() {
            found.extend(scan_code_dir(&code_dir));
        }
    }

    found
}

/// Merged coverage for every code found under `root`.
#[must_use]
pub fn scan_all(root: &Path) -> BTreeMap<String, Vec<DateInterval>> {
    let mut raw: BTreeMap<String, Vec<DateInterval>> = BTreeMap::new();

    for branch_dir in subdirs(root) {
        for code_dir in subdirs(&branch_dir) {
            let Some(code) = code_dir.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            raw.entry(code).or_default().extend(scan_code_dir(&code_dir));
        }
    }

    raw.into_iter()
        .filter(|(_, intervals)| !intervals.is_empty())
        .map(|(code, intervals)| (code, pos_sync_interval::merge(&intervals)))
        .collect()
}

/// Visible immediate sub-directories of `dir`.
fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| !is_hidden(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Dot-prefixed entries are scratch space and `_`-prefixed ones hold
/// metadata such as the stage ledger.
fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn has_regular_file(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|entries| {
        entries
            .filter_map(Result::ok)
            .any(|e| e.file_type().is_ok_and(|t| t.is_file()))
    })
}
