//! Settings for the `pos_sync` binary.
//!
//! Values are layered: an optional TOML file, then environment variables,
//! then command line flags. Later layers win.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pos_sync::DEFAULT_CHUNK_SIZE_DAYS;
use pos_sync_portal::{DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS, PortalConfig, ReportKind};
use serde::Deserialize;

/// Default data root, relative to the working directory.
pub const DEFAULT_DATA_ROOT: &str = "data";

/// Default branch configuration file, relative to the working directory.
pub const DEFAULT_BRANCHES_FILE: &str = "utils/sucursales.json";

/// Errors produced while assembling [`Settings`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for [`FileSettings`].
    #[error("invalid settings file {path}: {message}")]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// An environment variable held a value of the wrong shape.
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Rejected value.
        value: String,
    },

    /// No portal base URL was configured anywhere.
    #[error("no portal base URL configured (set WS_BASE, `base_url` or --base-url)")]
    MissingBaseUrl,
}

/// The shape of the optional TOML settings file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub branches_file: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub chunk_size_days: Option<u32>,
}

impl FileSettings {
    /// Reads and parses a settings file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub branches_file: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub chunk_size_days: Option<u32>,
}

/// Fully resolved settings.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub branches_file: PathBuf,
    pub data_root: PathBuf,
    pub chunk_size_days: u32,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("branches_file", &self.branches_file)
            .field("data_root", &self.data_root)
            .field("chunk_size_days", &self.chunk_size_days)
            .finish()
    }
}

impl Settings {
    /// Loads settings from `config_path` (if any), the process environment,
    /// and `overrides`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the settings file is unreadable or an
    /// environment variable is malformed.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let file = match config_path {
            Some(path) => FileSettings::from_path(path)?,
            None => FileSettings::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok(), overrides)
    }

    /// Layers `file`, the variables visible through `env`, and `overrides`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `WS_TIMEOUT` or `WS_RETRIES`
    /// is not a non-negative integer.
    pub fn resolve(
        file: FileSettings,
        env: impl Fn(&str) -> Option<String>,
        overrides: &Overrides,
    ) -> Result<Self, ConfigError> {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let timeout_secs = match env("WS_TIMEOUT") {
            Some(v) => Some(parse_number::<u64>("WS_TIMEOUT", &v)?),
            None => file.timeout_secs,
        };
        let retries = match env("WS_RETRIES") {
            Some(v) => Some(parse_number::<u32>("WS_RETRIES", &v)?),
            None => file.retries,
        };

        Ok(Self {
            base_url: overrides
                .base_url
                .clone()
                .or_else(|| env("WS_BASE"))
                .or(file.base_url),
            username: env("WS_USER").or(file.username),
            password: env("WS_PASS").or(file.password),
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            retries: retries.unwrap_or(DEFAULT_RETRIES),
            branches_file: overrides
                .branches_file
                .clone()
                .or_else(|| env("WS_SUCURSALES").map(PathBuf::from))
                .or(file.branches_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BRANCHES_FILE)),
            data_root: overrides
                .data_root
                .clone()
                .or_else(|| env("POS_SYNC_DATA_ROOT").map(PathBuf::from))
                .or(file.data_root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT)),
            chunk_size_days: overrides
                .chunk_size_days
                .or(file.chunk_size_days)
                .unwrap_or(DEFAULT_CHUNK_SIZE_DAYS),
        })
    }

    /// Portal settings for a sync run. Credentials are attached only when
    /// both a username and a password are set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingBaseUrl`] if no base URL was configured.
    pub fn portal_config(&self) -> Result<PortalConfig, ConfigError> {
        let base_url = self.base_url.as_deref().ok_or(ConfigError::MissingBaseUrl)?;

        let mut config = PortalConfig::new(base_url);
        config.timeout = self.timeout;
        config.retries = self.retries;
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            config = config.with_credentials(user.as_str(), pass.as_str());
        }
        Ok(config)
    }

    /// Where raw downloads for `kind` live: `<data_root>/a_raw/<dir>/batch`.
    #[must_use]
    pub fn raw_root(&self, kind: ReportKind) -> PathBuf {
        self.data_root
            .join("a_raw")
            .join(kind.dir_name())
            .join("batch")
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings =
            Settings::resolve(FileSettings::default(), env_of(&[]), &Overrides::default()).unwrap();

        assert_eq!(settings.base_url, None);
        assert_eq!(settings.timeout, Duration::from_secs(60));
        assert_eq!(settings.retries, 3);
        assert_eq!(settings.chunk_size_days, 180);
        assert_eq!(settings.branches_file, PathBuf::from("utils/sucursales.json"));
        assert_eq!(
            settings.raw_root(ReportKind::Detail),
            PathBuf::from("data/a_raw/sales/batch")
        );
        assert!(matches!(
            settings.portal_config(),
            Err(ConfigError::MissingBaseUrl)
        ));
    }

    #[test]
    fn env_overrides_file_and_flags_override_env() {
        let file: FileSettings = toml::from_str(
            r#"
            base_url = "https://file.example.com"
            username = "file-user"
            timeout_secs = 10
            retries = 1
            data_root = "/srv/file"
            chunk_size_days = 30
            "#,
        )
        .unwrap();
        let env = env_of(&[
            ("WS_BASE", "https://env.example.com"),
            ("WS_USER", "env-user"),
            ("WS_PASS", "secret"),
            ("WS_RETRIES", "5"),
            ("POS_SYNC_DATA_ROOT", "/srv/env"),
        ]);
        let overrides = Overrides {
            data_root: Some(PathBuf::from("/srv/flag")),
            chunk_size_days: Some(7),
            ..Overrides::default()
        };

        let settings = Settings::resolve(file, env, &overrides).unwrap();

        assert_eq!(settings.base_url.as_deref(), Some("https://env.example.com"));
        assert_eq!(settings.username.as_deref(), Some("env-user"));
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert_eq!(settings.retries, 5);
        assert_eq!(settings.data_root, PathBuf::from("/srv/flag"));
        assert_eq!(settings.chunk_size_days, 7);
        assert_eq!(
            settings.raw_root(ReportKind::Payments),
            PathBuf::from("/srv/flag/a_raw/payments/batch")
        );

        let portal = settings.portal_config().unwrap();
        assert_eq!(portal.base_url, "https://env.example.com");
        assert_eq!(portal.retries, 5);
        let credentials = portal.credentials.unwrap();
        assert_eq!(credentials.username, "env-user");
        assert_eq!(credentials.password, "secret");
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let file = FileSettings {
            base_url: Some("https://file.example.com".to_owned()),
            ..FileSettings::default()
        };
        let settings =
            Settings::resolve(file, env_of(&[("WS_BASE", "  ")]), &Overrides::default()).unwrap();
        assert_eq!(settings.base_url.as_deref(), Some("https://file.example.com"));
    }

    #[test]
    fn credentials_need_both_halves() {
        let settings = Settings::resolve(
            FileSettings::default(),
            env_of(&[("WS_BASE", "https://pos.example.com"), ("WS_USER", "ops")]),
            &Overrides::default(),
        )
        .unwrap();
        assert!(settings.portal_config().unwrap().credentials.is_none());
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = Settings::resolve(
            FileSettings::default(),
            env_of(&[("WS_TIMEOUT", "soon")]),
            &Overrides::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "WS_TIMEOUT", .. }
        ));
    }

    #[test]
    fn reads_settings_file_and_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("pos_sync.toml");
        std::fs::write(&good, "branches_file = \"conf/branches.json\"\n").unwrap();
        assert_eq!(
            FileSettings::from_path(&good).unwrap().branches_file,
            Some(PathBuf::from("conf/branches.json"))
        );

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "base_uri = \"typo\"\n").unwrap();
        assert!(matches!(
            FileSettings::from_path(&bad),
            Err(ConfigError::Parse { .. })
        ));

        assert!(matches!(
            FileSettings::from_path(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn debug_output_hides_password() {
        let settings = Settings::resolve(
            FileSettings::default(),
            env_of(&[("WS_PASS", "hunter2")]),
            &Overrides::default(),
        )
        .unwrap();
        assert!(!format!("{settings:?}").contains("hunter2"));
    }
}
