//! A single prepared statement and its bind/step/read lifecycle.

use indexmap::IndexMap;

use super::error::{CoreError, CoreResult};
use crate::engine::{ColumnType, RawStatement, StepResult};
use crate::value::{to_bind, Bind, Params, Value};

/// One row keyed by column name, in column order.
pub type Row = IndexMap<String, Value>;

/// Owns one engine statement plus the buffers bound into it.
///
/// Text and blob parameters are bound without copying, so the buffers in
/// `bound` must outlive the binding. Field order matters: `stmt` is declared
/// first so it is finalized before the buffers are dropped.
///
/// A `StatementCore` must not outlive the connection it was prepared on;
/// [`super::DatabaseCore`] frees every registered statement before closing.
#[derive(Debug)]
pub struct StatementCore {
    stmt: Option<RawStatement>,
    bound: Vec<Box<[u8]>>,
    /// Next positional index to read or bind, 1-based.
    pos: i32,
}

impl StatementCore {
    pub(crate) fn new(stmt: RawStatement) -> Self {
        Self {
            stmt: Some(stmt),
            bound: Vec::new(),
            pos: 1,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stmt.is_some()
    }

    fn raw(&self) -> CoreResult<&RawStatement> {
        self.stmt.as_ref().ok_or(CoreError::StatementClosed)
    }

    /// Reset the statement, then bind `params` positionally or by name.
    ///
    /// Named keys carry their sigil; keys the statement does not declare are skipped.
    pub fn bind(&mut self, params: &Params) -> CoreResult<bool> {
        self.raw()?;
        self.reset()?;

        match params {
            Params::Positional(values) => {
                for (i, value) in values.iter().enumerate() {
                    let index = i32::try_from(i + 1)
                        .map_err(|_| CoreError::invalid_arguments("bind", "too many parameters"))?;
                    self.bind_value(value, index)?;
                    self.pos = index + 1;
                }
            }
            Params::Named(values) => {
                for (name, value) in values {
                    if let Some(index) = self.raw()?.parameter_index(name) {
                        self.bind_value(value, index)?;
                    }
                }
            }
        }
        Ok(true)
    }

    fn bind_value(&mut self, value: &Value, index: i32) -> CoreResult<()> {
        match to_bind(value) {
            Bind::Null => self.raw()?.bind_null(index)?,
            Bind::Integer(i) => self.raw()?.bind_int64(index, i)?,
            Bind::Real(f) => self.raw()?.bind_double(index, f)?,
            Bind::Text(s) => self.bind_owned(index, s.into_bytes().into_boxed_slice(), true)?,
            Bind::Blob(b) => self.bind_owned(index, b.into_boxed_slice(), false)?,
        }
        Ok(())
    }

    fn bind_owned(&mut self, index: i32, buf: Box<[u8]>, text: bool) -> CoreResult<()> {
        self.bound.push(buf);
        let stmt = self.stmt.as_ref().ok_or(CoreError::StatementClosed)?;
        let buf = self.bound.last().map(|b| &b[..]).unwrap_or(&[]);
        // SAFETY: the buffer is owned by `self.bound`, whose boxed contents do not
        // move, and it is only released after reset or finalize.
        unsafe {
            if text {
                stmt.bind_text_static(index, buf)?;
            } else {
                stmt.bind_blob_static(index, buf)?;
            }
        }
        Ok(())
    }

    /// Advance one row. `true` when a row is available.
    pub fn step(&mut self) -> CoreResult<bool> {
        let stmt = self.raw()?;
        let result = stmt.step()?;
        self.pos = 1;
        Ok(result == StepResult::Row)
    }

    /// Read the current row, binding and stepping first when `params` is given.
    pub fn get(&mut self, params: Option<&Params>) -> CoreResult<Vec<Value>> {
        if let Some(params) = params {
            self.bind(params)?;
            self.step()?;
        }
        let stmt = self.raw()?;
        let values = (0..stmt.data_count())
            .map(|col| match stmt.column_type(col) {
                ColumnType::Integer => Value::Integer(stmt.column_int64(col)),
                ColumnType::Float => Value::Real(stmt.column_double(col)),
                ColumnType::Text => Value::Text(stmt.column_text(col)),
                ColumnType::Blob => Value::Blob(stmt.column_blob(col)),
                ColumnType::Null => Value::Null,
            })
            .collect();
        Ok(values)
    }

    /// Column names of the statement's result shape.
    pub fn column_names(&self) -> CoreResult<Vec<String>> {
        let stmt = self.raw()?;
        Ok((0..stmt.column_count()).map(|col| stmt.column_name(col)).collect())
    }

    /// Step to exhaustion, returning every row keyed by column name.
    pub fn get_as_object(&mut self) -> CoreResult<Vec<Row>> {
        let mut rows = Vec::new();
        let mut columns: Option<Vec<String>> = None;
        while self.step()? {
            if columns.is_none() {
                columns = Some(self.column_names()?);
            }
            let values = self.get(None)?;
            let names = columns.as_deref().unwrap_or_default();
            rows.push(names.iter().cloned().zip(values).collect());
        }
        Ok(rows)
    }

    /// Bind (if given), step once and reset, discarding any row.
    pub fn run(&mut self, params: Option<&Params>) -> CoreResult<()> {
        if let Some(params) = params {
            self.bind(params)?;
        }
        self.step()?;
        self.reset()?;
        Ok(())
    }

    /// Release bound buffers, clear bindings and reset the statement.
    ///
    /// Returns whether both engine calls succeeded.
    pub fn reset(&mut self) -> CoreResult<bool> {
        let stmt = self.stmt.as_ref().ok_or(CoreError::StatementClosed)?;
        let cleared = stmt.clear_bindings();
        let reset = stmt.reset();
        self.bound.clear();
        self.pos = 1;
        Ok(cleared && reset)
    }

    /// Finalize the statement and release its buffers. Later calls fail
    /// with [`CoreError::StatementClosed`].
    pub fn free(&mut self) -> CoreResult<bool> {
        let stmt = self.stmt.take().ok_or(CoreError::StatementClosed)?;
        let finalized = stmt.finalize();
        self.bound.clear();
        Ok(finalized)
    }
}
