//! Configuration module for sealed-sql.
//!
//! Handles connection options, environment variables, and settings.

mod connection;
mod settings;

pub use connection::{CacheMode, ConnectionOptions, OpenMode};
pub use settings::{
    expand_env_vars, ConnectionSettings, Settings, SettingsError, StorageSettings, WorkerSettings,
};
