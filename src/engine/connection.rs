//! Engine connection handle.

use std::os::raw::{c_char, c_int};
use std::ptr;

use rusqlite::{ffi, OpenFlags};

use super::statement::RawStatement;
use super::{EngineError, OK};

/// An open engine connection.
///
/// Statements prepared from a connection are raw handles; the owner must
/// finalize every one of them before calling [`Connection::close`].
pub struct Connection {
    conn: rusqlite::Connection,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection from a `file:` URI. Query parameters are passed to the engine.
    pub fn open(uri: &str) -> Result<Self, EngineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = rusqlite::Connection::open_with_flags(uri, flags)?;
        Ok(Self { conn })
    }

    /// Borrow the safe connection, for registering functions and the like.
    pub fn inner(&self) -> &rusqlite::Connection {
        &self.conn
    }

    fn handle(&self) -> *mut ffi::sqlite3 {
        // SAFETY: the handle is only used while `self` keeps the connection alive.
        unsafe { self.conn.handle() }
    }

    /// Execute one or more statements, discarding any rows.
    pub fn exec(&self, sql: &str) -> Result<(), EngineError> {
        self.conn.execute_batch(sql).map_err(EngineError::from)
    }

    /// Prepare the first statement of `sql`.
    ///
    /// Returns `None` when `sql` holds no statement (blank or comments only).
    pub fn prepare(&self, sql: &str) -> Result<Option<RawStatement>, EngineError> {
        self.prepare_at(sql, 0).map(|(stmt, _)| stmt)
    }

    /// Prepare the statement starting at byte `offset` of `sql`.
    ///
    /// Returns the statement (if any) and the offset where the next one starts,
    /// as reported by the engine's tail pointer.
    pub fn prepare_at(
        &self,
        sql: &str,
        offset: usize,
    ) -> Result<(Option<RawStatement>, usize), EngineError> {
        let rest = &sql.as_bytes()[offset.min(sql.len())..];
        if rest.is_empty() {
            return Ok((None, sql.len()));
        }
        let len = c_int::try_from(rest.len())
            .map_err(|_| EngineError::new(ffi::SQLITE_TOOBIG, "statement too long"))?;

        let db = self.handle();
        let start = rest.as_ptr() as *const c_char;
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();

        // SAFETY: `start..start+len` is a valid byte range; the engine writes the
        // statement and a tail pointer inside that range.
        let rc = unsafe { ffi::sqlite3_prepare_v2(db, start, len, &mut stmt, &mut tail) };
        if rc != OK {
            // SAFETY: db is alive for the duration of this call.
            return Err(unsafe { EngineError::from_handle(db, rc) });
        }

        let consumed = if tail.is_null() {
            rest.len()
        } else {
            (tail as usize).saturating_sub(start as usize).min(rest.len())
        };
        // SAFETY: stmt is either null or a fresh statement owned by us from here on.
        let statement = unsafe { RawStatement::from_raw(stmt) };
        Ok((statement, offset + consumed))
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> i64 {
        // SAFETY: the handle is alive.
        i64::from(unsafe { ffi::sqlite3_changes(self.handle()) })
    }

    /// Close the connection.
    pub fn close(self) -> Result<(), EngineError> {
        self.conn.close().map_err(|(_, err)| EngineError::from(err))
    }
}
