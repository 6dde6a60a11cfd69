//! Worker side of the bridge.
//!
//! The worker owns the database core and serves calls strictly one at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Caller process                          │
//! │   Database / Statement proxies ──▶ Transport (post + oneshot)   │
//! └─────────────────────────────────────────────────────────────────┘
//!                  │ in-process mpsc          │ NDJSON stdin/stdout
//!                  ▼                          ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Worker (own thread or `sealed-sql worker` child process)       │
//! │   inbox ──▶ SerialQueue ──▶ SequentialDispatcher ──▶ DatabaseCore│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sealed_sql::worker::{protocol::CallEnvelope, WorkerHandle};
//!
//! let worker = WorkerHandle::spawn(storage)?;
//! let (tx, rx) = tokio::sync::oneshot::channel();
//! worker.post(CallEnvelope::constructor(), tx)?;
//! assert!(rx.await?.is_ok());
//! ```

mod dispatcher;
pub mod protocol;
mod queue;
mod runtime;
mod stdio;

pub use dispatcher::SequentialDispatcher;
pub use queue::SerialQueue;
pub use runtime::{serve, QueuedCall, WorkerHandle};
pub use stdio::{serve_stdio, serve_stream};
