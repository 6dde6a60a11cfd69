//! Raw prepared-statement primitives.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr::NonNull;
use std::slice;

use rusqlite::ffi;

use super::{EngineError, OK};

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A row is available for reading.
    Row,
    /// The statement has finished.
    Done,
}

/// The engine's per-column storage class for the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Blob,
    Null,
}

/// An owned engine statement. Dropping it finalizes the statement.
///
/// Text and blob binds are made without copying: the caller guarantees the
/// bound buffer outlives the binding (until the next reset, clear or finalize).
pub struct RawStatement {
    ptr: NonNull<ffi::sqlite3_stmt>,
}

impl std::fmt::Debug for RawStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStatement").field("ptr", &self.ptr).finish()
    }
}

impl RawStatement {
    /// Take ownership of a freshly prepared statement pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a statement not owned by anything else.
    pub(crate) unsafe fn from_raw(ptr: *mut ffi::sqlite3_stmt) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    fn raw(&self) -> *mut ffi::sqlite3_stmt {
        self.ptr.as_ptr()
    }

    fn error(&self, code: c_int) -> EngineError {
        // SAFETY: a live statement always belongs to a live connection.
        unsafe { EngineError::from_handle(ffi::sqlite3_db_handle(self.raw()), code) }
    }

    fn check(&self, code: c_int) -> Result<(), EngineError> {
        if code == OK {
            Ok(())
        } else {
            Err(self.error(code))
        }
    }

    /// Advance one row, reporting any status other than row/done as an error.
    pub fn step(&self) -> Result<StepResult, EngineError> {
        // SAFETY: the statement is live.
        let rc = unsafe { ffi::sqlite3_step(self.raw()) };
        match rc {
            ffi::SQLITE_ROW => Ok(StepResult::Row),
            ffi::SQLITE_DONE => Ok(StepResult::Done),
            code => Err(self.error(code)),
        }
    }

    pub fn bind_null(&self, index: i32) -> Result<(), EngineError> {
        // SAFETY: the statement is live; out-of-range indexes are reported by the engine.
        self.check(unsafe { ffi::sqlite3_bind_null(self.raw(), index) })
    }

    pub fn bind_int64(&self, index: i32, value: i64) -> Result<(), EngineError> {
        // SAFETY: as above.
        self.check(unsafe { ffi::sqlite3_bind_int64(self.raw(), index, value) })
    }

    pub fn bind_double(&self, index: i32, value: f64) -> Result<(), EngineError> {
        // SAFETY: as above.
        self.check(unsafe { ffi::sqlite3_bind_double(self.raw(), index, value) })
    }

    /// Bind UTF-8 text without copying.
    ///
    /// # Safety
    ///
    /// `text` must stay alive and unmoved until the statement is reset,
    /// its bindings are cleared, or it is finalized.
    pub unsafe fn bind_text_static(&self, index: i32, text: &[u8]) -> Result<(), EngineError> {
        let len = c_int::try_from(text.len())
            .map_err(|_| EngineError::new(ffi::SQLITE_TOOBIG, "string or blob too big"))?;
        let rc = ffi::sqlite3_bind_text(
            self.raw(),
            index,
            text.as_ptr() as *const c_char,
            len,
            None,
        );
        self.check(rc)
    }

    /// Bind a blob without copying.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawStatement::bind_text_static`].
    pub unsafe fn bind_blob_static(&self, index: i32, blob: &[u8]) -> Result<(), EngineError> {
        let len = c_int::try_from(blob.len())
            .map_err(|_| EngineError::new(ffi::SQLITE_TOOBIG, "string or blob too big"))?;
        let rc = ffi::sqlite3_bind_blob(
            self.raw(),
            index,
            blob.as_ptr() as *const c_void,
            len,
            None,
        );
        self.check(rc)
    }

    /// Resolve a named parameter (sigil included) to its 1-based index.
    pub fn parameter_index(&self, name: &str) -> Option<i32> {
        let name = CString::new(name).ok()?;
        // SAFETY: the statement is live and `name` is NUL-terminated.
        let index = unsafe { ffi::sqlite3_bind_parameter_index(self.raw(), name.as_ptr()) };
        (index > 0).then_some(index)
    }

    pub fn clear_bindings(&self) -> bool {
        // SAFETY: the statement is live.
        unsafe { ffi::sqlite3_clear_bindings(self.raw()) == OK }
    }

    pub fn reset(&self) -> bool {
        // SAFETY: the statement is live.
        unsafe { ffi::sqlite3_reset(self.raw()) == OK }
    }

    /// Columns in the current row (zero when no row is available).
    pub fn data_count(&self) -> i32 {
        // SAFETY: the statement is live.
        unsafe { ffi::sqlite3_data_count(self.raw()) }
    }

    /// Columns in the statement's result shape.
    pub fn column_count(&self) -> i32 {
        // SAFETY: the statement is live.
        unsafe { ffi::sqlite3_column_count(self.raw()) }
    }

    pub fn column_type(&self, col: i32) -> ColumnType {
        // SAFETY: the statement is live.
        match unsafe { ffi::sqlite3_column_type(self.raw(), col) } {
            ffi::SQLITE_INTEGER => ColumnType::Integer,
            ffi::SQLITE_FLOAT => ColumnType::Float,
            ffi::SQLITE_TEXT => ColumnType::Text,
            ffi::SQLITE_BLOB => ColumnType::Blob,
            _ => ColumnType::Null,
        }
    }

    pub fn column_int64(&self, col: i32) -> i64 {
        // SAFETY: the statement is live.
        unsafe { ffi::sqlite3_column_int64(self.raw(), col) }
    }

    pub fn column_double(&self, col: i32) -> f64 {
        // SAFETY: the statement is live.
        unsafe { ffi::sqlite3_column_double(self.raw(), col) }
    }

    /// Copy a text column out of engine memory.
    pub fn column_text(&self, col: i32) -> String {
        // SAFETY: the pointer is valid for `column_bytes` bytes until the next
        // step/reset, and is copied before returning.
        unsafe {
            let ptr = ffi::sqlite3_column_text(self.raw(), col);
            let len = ffi::sqlite3_column_bytes(self.raw(), col);
            if ptr.is_null() || len <= 0 {
                return String::new();
            }
            let bytes = slice::from_raw_parts(ptr, len as usize);
            String::from_utf8_lossy(bytes).into_owned()
        }
    }

    /// Copy a blob column out of engine memory.
    pub fn column_blob(&self, col: i32) -> Vec<u8> {
        // SAFETY: as for column_text.
        unsafe {
            let ptr = ffi::sqlite3_column_blob(self.raw(), col);
            let len = ffi::sqlite3_column_bytes(self.raw(), col);
            if ptr.is_null() || len <= 0 {
                return Vec::new();
            }
            slice::from_raw_parts(ptr as *const u8, len as usize).to_vec()
        }
    }

    pub fn column_name(&self, col: i32) -> String {
        // SAFETY: the name pointer is valid until the statement is finalized or re-prepared.
        unsafe {
            let ptr = ffi::sqlite3_column_name(self.raw(), col);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    /// Finalize now, reporting the engine's status.
    pub fn finalize(self) -> bool {
        let ptr = self.raw();
        std::mem::forget(self);
        // SAFETY: ownership was taken above, so this is the only finalize.
        unsafe { ffi::sqlite3_finalize(ptr) == OK }
    }
}

impl Drop for RawStatement {
    fn drop(&mut self) {
        // SAFETY: the statement is owned and finalized exactly once.
        unsafe {
            ffi::sqlite3_finalize(self.raw());
        }
    }
}
