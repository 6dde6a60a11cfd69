//! TOML-based configuration for sealed-sql.
//!
//! Supports a config file (sealed-sql.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! path = "/usr/local/bin/sealed-sql"  # run the worker as a child process
//! call_timeout_secs = 30
//! shared = false
//!
//! [storage]
//! dir = "${HOME}/.local/share/sealed-sql"
//!
//! [connection]
//! identifier = "main"
//! key = "${SEALED_SQL_KEY}"
//! kdf = "none"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::connection::ConnectionOptions;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Worker configuration.
    pub worker: WorkerSettings,

    /// Storage configuration.
    pub storage: StorageSettings,

    /// Default connection.
    pub connection: ConnectionSettings,
}

/// Worker configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Path to a `sealed-sql` binary to run as a child-process worker.
    /// When unset, the worker runs on a thread in this process.
    pub path: Option<String>,

    /// Deadline for a single call, in seconds. Unset means no deadline.
    pub call_timeout_secs: Option<u64>,

    /// Whether other callers may share the worker's connection.
    pub shared: bool,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Mount root for database files (supports ${ENV_VAR} expansion).
    pub dir: Option<String>,
}

/// Connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Database identifier under the mount root.
    pub identifier: Option<String>,

    /// Open options; `key` and `salt` support ${ENV_VAR} expansion.
    #[serde(flatten)]
    pub options: ConnectionOptions,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `SEALED_SQL_CONFIG`
    /// 2. `./sealed-sql.toml`
    /// 3. `~/.config/sealed-sql/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("SEALED_SQL_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("sealed-sql.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("sealed-sql").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Get the child-process worker path, if one is configured.
    pub fn worker_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.worker
            .path
            .as_deref()
            .map(|p| expand_env_vars(p).map(PathBuf::from))
            .transpose()
    }

    /// Get the mount root: the configured directory, else the user data directory.
    pub fn storage_dir(&self) -> Result<Option<PathBuf>, SettingsError> {
        match &self.storage.dir {
            Some(dir) => Ok(Some(PathBuf::from(expand_env_vars(dir)?))),
            None => Ok(dirs::data_dir().map(|d| d.join("sealed-sql"))),
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.worker.call_timeout_secs.map(Duration::from_secs)
    }

    /// Get the connection options with environment variables expanded.
    ///
    /// Falls back to `SEALED_SQL_KEY` when no key is configured.
    pub fn connection_options(&self) -> Result<ConnectionOptions, SettingsError> {
        let mut options = self.connection.options.clone();
        options.key = expand_env_vars(&options.key)?;
        if let Some(salt) = &options.salt {
            options.salt = Some(expand_env_vars(salt)?);
        }
        if options.key.is_empty() {
            if let Ok(key) = env::var("SEALED_SQL_KEY") {
                options.key = key;
            }
        }
        Ok(options)
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name: String = if chars.next_if_eq(&'{').is_some() {
            let name = std::iter::from_fn(|| chars.next_if(|&ch| ch != '}')).collect();
            chars.next_if_eq(&'}');
            name
        } else {
            // $VAR ends at the first non-alphanumeric, non-underscore character
            std::iter::from_fn(|| chars.next_if(|&ch| ch.is_alphanumeric() || ch == '_')).collect()
        };

        if var_name.is_empty() {
            // Just a lone $, keep it
            result.push('$');
            continue;
        }
        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
