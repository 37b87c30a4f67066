//! # Settings
//!
//! Typed configuration for the binary, read from `simtree.toml`.
//!
//! ```toml
//! [storage]
//! backend = "redb"        # or "file"
//! path = "simtree.db"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! cors_origins = "http://localhost:3000"
//! rate_limit = 100        # requests per second, 0 disables
//!
//! [logging]
//! format = "text"         # or "json"
//! ```
//!
//! Precedence, highest first: command-line flags, `SIMTREE_*` environment
//! variables, the file, built-in defaults.

use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "simtree.toml";

/// Errors raised while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Where and how the history is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// redb ACID database file.
    #[default]
    Redb,
    /// Snapshot file loaded into memory and written back after changes.
    File,
}

impl Backend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Redb => "redb",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Comma-separated origins, `*` for any. Unset means localhost only.
    #[serde(default)]
    pub cors_origins: Option<String>,
    /// Requests per second across all clients; 0 disables limiting.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Bearer token required on every endpoint except `/health`.
    ///
    /// Never read from the file; only `SIMTREE_API_KEY` sets it.
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: None,
            rate_limit: default_rate_limit(),
            api_key: None,
            body_limit: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,
}

// =============================================================================
// LOADING
// =============================================================================

impl Settings {
    /// Parse settings from TOML text. No environment overrides are applied.
    pub fn parse(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Load settings from `path`, or from [`DEFAULT_CONFIG_FILE`] if it
    /// exists, then apply `SIMTREE_*` environment overrides.
    ///
    /// An explicit `path` that cannot be read is an error; a missing
    /// default file is not.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// Recognised: `SIMTREE_DATABASE`, `SIMTREE_BACKEND`, `SIMTREE_API_KEY`,
    /// `SIMTREE_RATE_LIMIT`, `SIMTREE_CORS_ORIGINS`, `SIMTREE_LOG_FORMAT`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SIMTREE_DATABASE").filter(|v| !v.is_empty()) {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(value) = lookup("SIMTREE_BACKEND") {
            self.storage.backend = Backend::from_str(&value, true).map_err(|_| {
                SettingsError::InvalidValue {
                    key: "SIMTREE_BACKEND",
                    value,
                }
            })?;
        }
        if let Some(key) = lookup("SIMTREE_API_KEY") {
            self.server.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(value) = lookup("SIMTREE_RATE_LIMIT") {
            self.server.rate_limit =
                value
                    .trim()
                    .parse()
                    .map_err(|_| SettingsError::InvalidValue {
                        key: "SIMTREE_RATE_LIMIT",
                        value,
                    })?;
        }
        if let Some(origins) = lookup("SIMTREE_CORS_ORIGINS") {
            self.server.cors_origins = Some(origins).filter(|o| !o.trim().is_empty());
        }
        if let Some(value) = lookup("SIMTREE_LOG_FORMAT") {
            self.logging.format = match value.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                _ => {
                    return Err(SettingsError::InvalidValue {
                        key: "SIMTREE_LOG_FORMAT",
                        value,
                    });
                }
            };
        }
        Ok(())
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("simtree.db")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8080
}

const fn default_rate_limit() -> u32 {
    100
}

const fn default_body_limit() -> usize {
    2 * 1024 * 1024
}

// =============================================================================
// TESTS
// =============================================================================
