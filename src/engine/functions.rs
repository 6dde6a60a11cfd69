//! String helper functions registered on every connection.

use rusqlite::ffi;
use rusqlite::functions::{Context, FunctionFlags};

use super::{Connection, EngineError};

type FnResult = rusqlite::Result<Option<String>>;

/// Largest string a helper may produce, the engine's default length limit.
const MAX_RESULT_BYTES: usize = 1_000_000_000;

fn flags() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
}

fn text_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    ctx.get::<Option<String>>(idx)
}

fn count_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<usize> {
    let n = ctx.get::<Option<i64>>(idx)?.unwrap_or(0);
    Ok(usize::try_from(n).unwrap_or(0))
}

fn reverse(ctx: &Context<'_>) -> FnResult {
    Ok(text_arg(ctx, 0)?.map(|s| s.chars().rev().collect()))
}

// No message: the engine then reports its own text for the code.
fn too_big() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_TOOBIG), None)
}

fn replicate(ctx: &Context<'_>) -> FnResult {
    let n = count_arg(ctx, 1)?;
    let Some(s) = text_arg(ctx, 0)? else {
        return Ok(None);
    };
    match s.len().checked_mul(n) {
        Some(len) if len <= MAX_RESULT_BYTES => Ok(Some(s.repeat(n))),
        _ => Err(too_big()),
    }
}

fn leftstr(ctx: &Context<'_>) -> FnResult {
    let n = count_arg(ctx, 1)?;
    Ok(text_arg(ctx, 0)?.map(|s| s.chars().take(n).collect()))
}

fn rightstr(ctx: &Context<'_>) -> FnResult {
    let n = count_arg(ctx, 1)?;
    Ok(text_arg(ctx, 0)?.map(|s| {
        let len = s.chars().count();
        s.chars().skip(len.saturating_sub(n)).collect()
    }))
}

// Capitalize the first letter of each word, lowercase the rest.
fn proper(ctx: &Context<'_>) -> FnResult {
    Ok(text_arg(ctx, 0)?.map(|s| {
        let mut out = String::with_capacity(s.len());
        let mut at_word_start = true;
        for c in s.chars() {
            if c.is_alphanumeric() {
                if at_word_start {
                    out.extend(c.to_uppercase());
                } else {
                    out.extend(c.to_lowercase());
                }
                at_word_start = false;
            } else {
                out.push(c);
                at_word_start = true;
            }
        }
        out
    }))
}

/// Register the helper functions on `conn`.
pub fn register_functions(conn: &Connection) -> Result<(), EngineError> {
    let db = conn.inner();
    db.create_scalar_function("reverse", 1, flags(), reverse)?;
    db.create_scalar_function("replicate", 2, flags(), replicate)?;
    db.create_scalar_function("leftstr", 2, flags(), leftstr)?;
    db.create_scalar_function("rightstr", 2, flags(), rightstr)?;
    db.create_scalar_function("proper", 1, flags(), proper)?;
    Ok(())
}
