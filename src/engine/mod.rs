//! Thin capability layer over the embedded SQL engine.
//!
//! The rest of the crate only ever talks to the engine through this module:
//! open a connection from a URI, execute batches, prepare statements one at a
//! time (following the engine's tail pointer), and drive statements with
//! bind/step/column primitives. Everything above this layer is engine-agnostic.

mod connection;
mod functions;
mod statement;

pub use connection::Connection;
pub use functions::register_functions;
pub use statement::{ColumnType, RawStatement, StepResult};

use std::ffi::CStr;
use std::os::raw::c_int;

use rusqlite::ffi;

/// Status code the engine uses for success.
pub const OK: c_int = ffi::SQLITE_OK;

/// An error reported by the engine, with its own status code and message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    /// Extended engine result code, or -1 when the failure did not originate in the engine.
    pub code: i32,
    /// The engine's error text, verbatim.
    pub message: String,
}

impl EngineError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build an error from a status code, reading the message from the connection.
    ///
    /// # Safety
    ///
    /// `db` must be a live connection handle or null.
    pub(crate) unsafe fn from_handle(db: *mut ffi::sqlite3, code: c_int) -> Self {
        let message = if db.is_null() {
            errstr(code)
        } else {
            let msg = ffi::sqlite3_errmsg(db);
            if msg.is_null() {
                errstr(code)
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        };
        Self { code, message }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(e, _) => e.extended_code,
            _ => -1,
        };
        let message = match err {
            rusqlite::Error::SqliteFailure(_, Some(msg)) => msg,
            other => other.to_string(),
        };
        Self { code, message }
    }
}

fn errstr(code: c_int) -> String {
    // SAFETY: sqlite3_errstr returns a pointer to a static string.
    unsafe {
        let msg = ffi::sqlite3_errstr(code);
        if msg.is_null() {
            format!("engine error {}", code)
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

/// Bring up the engine library. Idempotent.
pub fn initialize() -> Result<(), EngineError> {
    // SAFETY: sqlite3_initialize is safe to call any number of times.
    let rc = unsafe { ffi::sqlite3_initialize() };
    if rc == OK {
        Ok(())
    } else {
        Err(EngineError::new(rc, errstr(rc)))
    }
}
