#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Branch registry: resolves a logical branch to the provider code that
//! addressed it on a given date.
//!
//! The registry is loaded from a JSON object mapping keys to codes. Keys that
//! share a prefix before the first `_` (e.g. `Kavia` and `Kavia_OLD`) belong
//! to the same logical branch, each contributing one [`CodeWindow`].
//!
//! ```json
//! {
//!   "Kavia": { "code": "8777", "valid_from": "2024-02-21", "valid_to": null },
//!   "Kavia_OLD": { "code": "6161", "valid_from": "2022-11-01", "valid_to": "2024-02-20" },
//!   "QIN": "6190"
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use pos_sync_interval::DateInterval;
use serde_json::Value;

pub use pos_sync_branch_models::{BranchEntry, CodeWindow};

/// Logical branches that are never synced, whatever their windows say.
pub const EXCLUDED_BRANCHES: &[&str] = &["CEDIS"];

/// Separates the logical branch name from a historical-variant suffix.
pub const KEY_SEPARATOR: char = '_';

/// Errors raised while loading or querying the branch registry.
#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    /// The configuration file could not be read.
    #[error("failed to read branch config {path}: {source}")]
    Io {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration is not valid JSON.
    #[error("branch config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration entry is malformed.
    #[error("invalid branch config entry '{key}': {message}")]
    Config {
        /// Offending key.
        key: String,
        /// What is wrong with it.
        message: String,
    },

    /// The branch is not in the registry.
    #[error("unknown branch '{0}'")]
    UnknownBranch(String),

    /// No window of a known branch covers the requested date.
    #[error("no code window for branch '{branch}' covers {date}")]
    NoCodeForDate {
        /// Logical branch name.
        branch: String,
        /// Date that was looked up.
        date: NaiveDate,
    },
}

impl BranchError {
    /// Per-lookup misses the caller may skip; everything else is a load-time
    /// failure.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownBranch(_) | Self::NoCodeForDate { .. })
    }
}

/// Time-windowed mapping from logical branch names to provider codes.
#[derive(Debug, Clone, Default)]
pub struct BranchRegistry {
    windows: BTreeMap<String, Vec<CodeWindow>>,
}

impl BranchRegistry {
    /// Loads the registry from a JSON file using the default deny-list.
    ///
    /// # Errors
    ///
    /// Returns [`BranchError`] if the file cannot be read or any entry is
    /// malformed.
    pub fn from_path(path: &Path) -> Result<Self, BranchError> {
        let text = std::fs::read_to_string(path).map_err(|source| BranchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json_str(&text)?;
        log::info!(
            "Loaded {} branch(es) from {}",
            registry.windows.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Parses the registry from a JSON string using the default deny-list.
    ///
    /// # Errors
    ///
    /// Returns [`BranchError`] if the JSON is invalid or any entry is
    /// malformed.
    pub fn from_json_str(json: &str) -> Result<Self, BranchError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value, EXCLUDED_BRANCHES)
    }

    /// Builds the registry from an already-parsed JSON value, skipping every
    /// logical branch named in `excluded`.
    ///
    /// # Errors
    ///
    /// Returns [`BranchError::Config`] naming the offending key if an entry
    /// is malformed or two windows of one branch overlap.
    pub fn from_value(value: &Value, excluded: &[&str]) -> Result<Self, BranchError> {
        let Value::Object(entries) = value else {
            return Err(BranchError::Config {
                key: "<root>".to_owned(),
                message: "expected a JSON object mapping name -> code".to_owned(),
            });
        };

        let mut windows: BTreeMap<String, Vec<CodeWindow>> = BTreeMap::new();

        for (key, raw) in entries {
            let logical = logical_name(key);
            if logical.is_empty() {
                return Err(config_error(key, "branch name before '_' is empty"));
            }
            if excluded.contains(&logical) {
                log::debug!("Skipping excluded branch key {key}");
                continue;
            }

            let window = parse_entry(key, raw)?.into_window(key);
            windows.entry(logical.to_owned()).or_default().push(window);
        }

        for (branch, list) in &mut windows {
            list.sort_by_key(|w| w.valid_from);
            if let Some(pair) = list.windows(2).find(|pair| pair[0].overlaps(&pair[1])) {
                return Err(config_error(
                    &pair[1].source_key,
                    &format!(
                        "window for code {} overlaps code {} ('{}') of branch {branch}",
                        pair[1].code, pair[0].code, pair[0].source_key,
                    ),
                ));
            }
        }

        Ok(Self { windows })
    }

    /// Logical branch names, sorted.
    #[must_use]
    pub fn branches(&self) -> Vec<&str> {
        self.windows.keys().map(String::as_str).collect()
    }

    /// All windows of a branch, ascending by `valid_from`.
    #[must_use]
    pub fn windows(&self, branch: &str) -> Option<&[CodeWindow]> {
        self.windows.get(branch).map(Vec::as_slice)
    }

    /// Iterates over `(branch, windows)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[CodeWindow])> {
        self.windows
            .iter()
            .map(|(name, list)| (name.as_str(), list.as_slice()))
    }

    /// Windows of `branch` intersecting `range`, each clamped to `range`.
    ///
    /// # Errors
    ///
    /// Returns [`BranchError::UnknownBranch`] if the branch is not
    /// registered.
    pub fn windows_for(
        &self,
        branch: &str,
        range: &DateInterval,
    ) -> Result<Vec<CodeWindow>, BranchError> {
        let list = self
            .windows
            .get(branch)
            .ok_or_else(|| BranchError::UnknownBranch(branch.to_owned()))?;

        Ok(list.iter().filter_map(|w| w.clamped_to(range)).collect())
    }

    /// The code addressing `branch` on `date`.
    ///
    /// # Errors
    ///
    /// Returns [`BranchError::UnknownBranch`] or
    /// [`BranchError::NoCodeForDate`]; both are recoverable.
    pub fn code_at(&self, branch: &str, date: NaiveDate) -> Result<&str, BranchError> {
        let list = self
            .windows
            .get(branch)
            .ok_or_else(|| BranchError::UnknownBranch(branch.to_owned()))?;

        list.iter()
            .find(|w| w.covers(date))
            .map(|w| w.code.as_str())
            .ok_or_else(|| BranchError::NoCodeForDate {
                branch: branch.to_owned(),
                date,
            })
    }

    /// Every branch with a code valid on `date`, mapped to that code.
    #[must_use]
    pub fn codes_on(&self, date: NaiveDate) -> BTreeMap<&str, &str> {
        self.windows
            .iter()
            .filter_map(|(name, list)| {
                list.iter()
                    .find(|w| w.covers(date))
                    .map(|w| (name.as_str(), w.code.as_str()))
            })
            .collect()
    }
}

/// The logical branch a configuration key belongs to.
#[must_use]
pub fn logical_name(key: &str) -> &str {
    key.split(KEY_SEPARATOR).next().unwrap_or(key)
}

fn config_error(key: &str, message: &str) -> BranchError {
    BranchError::Config {
        key: key.to_owned(),
        message: message.to_owned(),
    }
}

/// Deserializes one entry into a [`BranchEntry`].
///
/// Numeric codes are accepted and kept as strings, and blank date strings
/// read as absent.
fn parse_entry(key: &str, raw: &Value) -> Result<BranchEntry, BranchError> {
    let normalized = match raw {
        Value::String(code) if code.trim().is_empty() => {
            return Err(config_error(key, "code is empty"));
        }
        Value::String(_) => raw.clone(),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Object(fields) => {
            let mut fields = fields.clone();
            match fields.get("code") {
                Some(Value::String(code)) if !code.trim().is_empty() => {}
                Some(Value::Number(n)) => {
                    let code = Value::String(n.to_string());
                    fields.insert("code".to_owned(), code);
                }
                Some(_) => return Err(config_error(key, "'code' must be a non-empty string")),
                None => return Err(config_error(key, "object has no 'code' field")),
            }
            fields.retain(|field, value| {
                field == "code" || !matches!(value, Value::String(s) if s.trim().is_empty())
            });
            Value::Object(fields)
        }
        other => {
            return Err(config_error(
                key,
                &format!(
                    "unsupported type {} (expected string or object with 'code')",
                    json_type_name(other)
                ),
            ));
        }
    };

    let entry: BranchEntry = serde_json::from_value(normalized).map_err(|e| {
        config_error(
            key,
            &format!("valid_from/valid_to must be YYYY-MM-DD strings or null: {e}"),
        )
    })?;

    if let BranchEntry::Window {
        valid_from: Some(from),
        valid_to: Some(to),
        ..
    } = &entry
        && to < from
    {
        return Err(config_error(
            key,
            &format!("valid_to {to} is before valid_from {from}"),
        ));
    }

    Ok(entry)
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
