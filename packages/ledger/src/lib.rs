#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Stage ledger: one JSON record per (stage directory, date range) saying
//! whether that stage last completed successfully and with which version of
//! its logic.
//!
//! Records live at `<stage_dir>/_meta/<start>_<end>.json`. A missing,
//! unreadable, or corrupted record is indistinguishable from "never ran":
//! the stage simply runs again.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use pos_sync_interval::DateInterval;
use serde::{Deserialize, Deserializer, Serialize};

/// Name of the metadata directory inside a stage directory.
pub const META_DIR: &str = "_meta";

/// Errors raised while persisting a record.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Writing or renaming the record failed.
    #[error("I/O error writing {path}: {source}")]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serializing the record failed.
    #[error("failed to serialize stage record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of the last attempt of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Every unit of work completed.
    Ok,
    /// Nothing completed.
    Failed,
    /// Some units of work completed and some failed.
    Partial,
}

/// Completion record for one stage over one requested date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// First day of the requested range.
    pub start_date: chrono::NaiveDate,
    /// Last day of the requested range.
    pub end_date: chrono::NaiveDate,
    /// Branches that were processed.
    pub branches: Vec<String>,
    /// Version of the stage logic that produced the outputs.
    #[serde(alias = "cleaner_version", alias = "version")]
    pub stage_version: String,
    /// When the attempt finished.
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_run: DateTime<Utc>,
    /// Outcome of the attempt.
    pub status: StageStatus,
}

impl StageRecord {
    /// Creates a record for `range` stamped with the current time.
    #[must_use]
    pub fn new(
        range: &DateInterval,
        branches: Vec<String>,
        stage_version: &str,
        status: StageStatus,
    ) -> Self {
        Self {
            start_date: range.start(),
            end_date: range.end(),
            branches,
            stage_version: stage_version.to_owned(),
            last_run: Utc::now(),
            status,
        }
    }

    /// Whether this record means the stage is done for `version`.
    #[must_use]
    pub fn is_satisfied(&self, version: &str) -> bool {
        self.status == StageStatus::Ok && self.stage_version == version
    }
}

/// Path of the record for `range` under `stage_dir`.
#[must_use]
pub fn record_path(stage_dir: &Path, range: &DateInterval) -> PathBuf {
    stage_dir.join(META_DIR).join(format!("{range}.json"))
}

/// Reads the record for `range`, treating anything unreadable as absent.
#[must_use]
pub fn read(stage_dir: &Path, range: &DateInterval) -> Option<StageRecord> {
    let path = record_path(stage_dir, range);

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("Unreadable stage record {}: {e}", path.display());
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!(
                "Corrupted stage record {} (treating as missing): {e}",
                path.display()
            );
            None
        }
    }
}

/// Whether a stage must (re-)run for `range` under `version`.
///
/// True when `force` is set, no record exists, the last attempt did not
/// finish `ok`, or it was produced by a different version.
#[must_use]
pub fn should_run(stage_dir: &Path, range: &DateInterval, version: &str, force: bool) -> bool {
    if force {
        log::debug!("{}: forced run for {range}", stage_dir.display());
        return true;
    }

    match read(stage_dir, range) {
        None => true,
        Some(record) if record.is_satisfied(version) => false,
        Some(record) => {
            log::debug!(
                "{}: rerun for {range} (status={:?}, version={} vs {version})",
                stage_dir.display(),
                record.status,
                record.stage_version,
            );
            true
        }
    }
}

/// Persists `record` for `range`, replacing any previous one atomically.
///
/// The record is written to a temporary sibling and renamed into place, so a
/// reader sees either the old record or the new one, never a partial file.
///
/// # Errors
///
/// Returns [`LedgerError`] if serialization or any filesystem step fails.
pub fn write(stage_dir: &Path, range: &DateInterval, record: &StageRecord) -> Result<(), LedgerError> {
    let path = record_path(stage_dir, range);
    let io_err = |source| LedgerError::Io {
        path: path.clone(),
        source,
    };

    let dir = stage_dir.join(META_DIR);
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    let body = serde_json::to_vec_pretty(record)?;
    let tmp = dir.join(format!(".{range}.json.tmp-{}", std::process::id()));

    std::fs::write(&tmp, body).map_err(io_err)?;
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(e));
    }

    log::debug!("Wrote stage record {}", path.display());
    Ok(())
}

/// Accepts RFC 3339 timestamps and offset-less ISO-8601 ones (read as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid last_run '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> DateInterval {
        DateInterval::parse("2025-01-01", "2025-01-31").unwrap()
    }

    #[test]
    fn missing_record_means_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(dir.path(), &range()).is_none());
        assert!(should_run(dir.path(), &range(), "extract_v1", false));
    }

    #[test]
    fn ok_record_with_same_version_skips() {
        let dir = tempfile::tempdir().unwrap();
        let record = StageRecord::new(&range(), vec!["Kavia".into()], "v1", StageStatus::Ok);
        write(dir.path(), &range(), &record).unwrap();

        assert!(!should_run(dir.path(), &range(), "v1", false));
        assert!(should_run(dir.path(), &range(), "v2", false));
        assert!(should_run(dir.path(), &range(), "v1", true));
    }

    #[test]
    fn failed_or_partial_records_rerun() {
        let dir = tempfile::tempdir().unwrap();
        for status in [StageStatus::Failed, StageStatus::Partial] {
            let record = StageRecord::new(&range(), vec![], "v1", status);
            write(dir.path(), &range(), &record).unwrap();
            assert!(should_run(dir.path(), &range(), "v1", false));
        }
    }

    #[test]
    fn round_trips_record_at_expected_path() {
        let dir = tempfile::tempdir().unwrap();
        let record = StageRecord::new(&range(), vec!["QIN".into()], "v3", StageStatus::Partial);
        write(dir.path(), &range(), &record).unwrap();

        let expected = dir.path().join("_meta").join("2025-01-01_2025-01-31.json");
        assert_eq!(record_path(dir.path(), &range()), expected);
        assert!(expected.is_file());
        assert_eq!(read(dir.path(), &range()), Some(record));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("_meta"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn serializes_lowercase_status() {
        let record = StageRecord::new(&range(), vec![], "v1", StageStatus::Ok);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["start_date"], "2025-01-01");
        assert_eq!(json["stage_version"], "v1");
    }

    #[test]
    fn corrupted_record_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = record_path(dir.path(), &range());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(read(dir.path(), &range()).is_none());
        assert!(should_run(dir.path(), &range(), "v1", false));
    }

    #[test]
    fn reads_legacy_field_names_and_naive_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = record_path(dir.path(), &range());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{
                "start_date": "2025-01-01",
                "end_date": "2025-01-31",
                "branches": ["Kavia"],
                "cleaner_version": "sales_cleaner_v1",
                "last_run": "2025-01-15T12:00:00.123456",
                "status": "ok"
            }"#,
        )
        .unwrap();

        let record = read(dir.path(), &range()).unwrap();
        assert_eq!(record.stage_version, "sales_cleaner_v1");
        assert_eq!(record.last_run.to_rfc3339(), "2025-01-15T12:00:00.123456+00:00");
        assert!(!should_run(dir.path(), &range(), "sales_cleaner_v1", false));
    }
}
