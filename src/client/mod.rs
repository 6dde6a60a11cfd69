//! Caller side of the bridge.
//!
//! [`Database`] and [`Statement`] turn each method into one call envelope,
//! hand it to a [`Transport`], and wait for the single reply. Two transports
//! are provided:
//!
//! - [`crate::worker::WorkerHandle`]: a worker thread in this process
//! - [`ProcessTransport`]: a `sealed-sql worker` child process over stdin/stdout

mod database;
mod error;
mod process;
mod statement;
mod transport;

pub use database::{ClientOptions, Database, Output};
pub use error::{ClientError, ClientResult, ErrorKind, RemoteError, TransportError};
pub use process::ProcessTransport;
pub use statement::Statement;
pub use transport::Transport;
