//! # sealed-sql
//!
//! An encrypted embedded SQL engine that runs inside a worker and is driven
//! from the caller through async proxies.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        client: Database / Statement proxies             │
//! └─────────────────────────────────────────────────────────┘
//!                          │ CallEnvelope / ReplyEnvelope
//!                          ▼ [transport: thread or child process]
//! ┌─────────────────────────────────────────────────────────┐
//! │   worker: SerialQueue ──▶ SequentialDispatcher          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [whitelisted operations]
//! ┌─────────────────────────────────────────────────────────┐
//! │   core: DatabaseCore + StatementRegistry                │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │   engine (SQLite FFI)          storage (mount root)     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod crypto;
pub mod engine;
pub mod storage;
pub mod value;
pub mod worker;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::client::{ClientError, Database, ErrorKind, Statement};
    pub use crate::config::{ConnectionOptions, OpenMode, Settings};
    pub use crate::core::{ExecResult, ExportEncoding, Exported, Row};
    pub use crate::params;
    pub use crate::value::{Params, Value};
}

pub use client::{Database, Statement};
pub use value::{Params, Value};
