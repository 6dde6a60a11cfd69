//! Connection options and the engine open URI.
//!
//! Every option becomes a query parameter on the `file:` URI handed to the
//! engine.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    Ro,
    Rw,
    Rwc,
    Memory,
}

impl OpenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenMode::Ro => "ro",
            OpenMode::Rw => "rw",
            OpenMode::Rwc => "rwc",
            OpenMode::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Shared,
    Private,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Shared => "shared",
            CacheMode::Private => "private",
        }
    }
}

/// Options for opening an encrypted database.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Encryption secret. Required to mount.
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OpenMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immutable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nolock: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psow: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<JsonValue>,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("key", &"<redacted>")
            .field("mode", &self.mode)
            .field("cache", &self.cache)
            .field("immutable", &self.immutable)
            .field("nolock", &self.nolock)
            .field("vfs", &self.vfs)
            .field("kdf", &self.kdf)
            .field("salt", &self.salt.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

fn flag(b: bool) -> String {
    if b { "1" } else { "0" }.to_string()
}

fn scalar(v: &JsonValue) -> String {
    match v {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ConnectionOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    /// Query parameters in a fixed order, unset options omitted.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("key", self.key.clone())];
        let optional = [
            ("mode", self.mode.map(|m| m.as_str().to_string())),
            ("cache", self.cache.map(|c| c.as_str().to_string())),
            ("immutable", self.immutable.map(flag)),
            ("nolock", self.nolock.map(flag)),
            ("vfs", self.vfs.clone()),
            ("kdf", self.kdf.clone()),
            ("salt", self.salt.clone()),
            ("page_size", self.page_size.as_ref().map(scalar)),
            ("psow", self.psow.map(flag)),
            ("header", self.header.as_ref().map(scalar)),
            ("skip", self.skip.as_ref().map(scalar)),
        ];
        pairs.extend(
            optional
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name, v))),
        );
        pairs
    }

    /// Build the engine open URI for the database file at `path`.
    pub fn to_uri(&self, path: &Path) -> String {
        let path = path.to_string_lossy().replace('\\', "/");
        let encoded_path = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let query = self
            .query_pairs()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, urlencoding::encode(&value)))
            .collect::<Vec<_>>()
            .join("&");
        format!("file:{}?{}", encoded_path, query)
    }
}
