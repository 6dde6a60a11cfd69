//! Worker-side database core.
//!
//! [`DatabaseCore`] owns the engine connection and every prepared statement,
//! keyed by an opaque [`StatementId`]. Callers never hold a statement object;
//! the dispatcher resolves ids through the core on every call.
//!
//! ```text
//!  Unmounted ──mount──▶ Mounted ──close──▶ Closed
//!                         ▲                   │
//!                         └───────mount───────┘
//! ```

mod database;
mod error;
mod statement;

pub use database::{
    DatabaseCore, ExecResult, ExportEncoding, Exported, MountState, StatementId,
    StatementRegistry, DEFAULT_IDENTIFIER,
};
pub use error::{CoreError, CoreResult, ErrorFamily};
pub use statement::{Row, StatementCore};
