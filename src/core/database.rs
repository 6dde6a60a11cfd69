//! The engine connection lifecycle and the registry of live statements.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{CoreError, CoreResult};
use super::statement::StatementCore;
use crate::config::ConnectionOptions;
use crate::engine::{self, Connection};
use crate::storage::{Storage, StorageError};
use crate::value::{Params, Value};

/// Public identifier of a prepared statement.
pub type StatementId = i64;

/// Identifier used when mount is given none.
pub const DEFAULT_IDENTIFIER: &str = "default";

/// Table created on every mount to force the engine to read the file.
const METADATA_TABLE: &str = "_sealed_metadata";

fn bootstrap_sql() -> String {
    format!(
        "PRAGMA encoding=\"UTF-8\"; CREATE TABLE IF NOT EXISTS {} (key text, value text);",
        METADATA_TABLE
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounted,
    Closed,
}

/// Result of one statement run by [`DatabaseCore::execute`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportEncoding {
    #[default]
    Binary,
    Utf8,
}

/// A database image produced by [`DatabaseCore::export`].
#[derive(Debug, Clone, PartialEq)]
pub enum Exported {
    Binary(Vec<u8>),
    Utf8(String),
}

/// Live statements keyed by id. Ids come from a counter and are never reused.
#[derive(Debug)]
pub struct StatementRegistry {
    live: IndexMap<StatementId, StatementCore>,
    next_id: StatementId,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self {
            live: IndexMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, stmt: StatementCore) -> StatementId {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, stmt);
        id
    }

    fn missing(&self, id: StatementId) -> CoreError {
        if id > 0 && id < self.next_id {
            CoreError::StatementClosed
        } else {
            CoreError::UnknownStatementId(id)
        }
    }

    pub fn get_mut(&mut self, id: StatementId) -> CoreResult<&mut StatementCore> {
        if !self.live.contains_key(&id) {
            return Err(self.missing(id));
        }
        self.live.get_mut(&id).ok_or(CoreError::UnknownStatementId(id))
    }

    /// Finalize and drop one statement.
    pub fn free(&mut self, id: StatementId) -> CoreResult<bool> {
        match self.live.shift_remove(&id) {
            Some(mut stmt) => stmt.free(),
            None => Err(self.missing(id)),
        }
    }

    /// Finalize every live statement, in creation order.
    pub fn free_all(&mut self) {
        for (id, mut stmt) in self.live.drain(..) {
            if !matches!(stmt.free(), Ok(true)) {
                debug!(statement_id = id, "statement finalized with a pending error");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for StatementRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_identifier(identifier: &str) -> CoreResult<()> {
    let bad = identifier.is_empty()
        || identifier == "."
        || identifier == ".."
        || identifier
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '\0'));
    if bad {
        Err(CoreError::InvalidIdentifier(identifier.to_string()))
    } else {
        Ok(())
    }
}

/// Owns the engine connection for one worker.
///
/// `statements` is declared before `conn` so that, when the core is dropped,
/// every statement is finalized before the connection closes.
#[derive(Debug)]
pub struct DatabaseCore {
    statements: StatementRegistry,
    conn: Option<Connection>,
    state: MountState,
    storage: Arc<dyn Storage>,
    options: Option<ConnectionOptions>,
    identifier: Option<String>,
    storage_dir: Option<PathBuf>,
}

impl DatabaseCore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            statements: StatementRegistry::new(),
            conn: None,
            state: MountState::Unmounted,
            storage,
            options: None,
            identifier: None,
            storage_dir: None,
        }
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    fn conn(&self) -> CoreResult<&Connection> {
        self.conn.as_ref().ok_or(CoreError::NotMounted)
    }

    /// Open `<root>/<identifier>.db` with `options`.
    pub async fn mount(
        &mut self,
        options: ConnectionOptions,
        identifier: Option<String>,
        storage_dir: Option<PathBuf>,
    ) -> CoreResult<()> {
        if self.state == MountState::Mounted {
            return Err(CoreError::AlreadyMounted);
        }
        if !options.has_key() {
            return Err(CoreError::MissingKey);
        }
        let identifier = identifier.unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string());
        validate_identifier(&identifier)?;

        self.storage.mount(storage_dir.as_deref()).await?;
        let path = self.storage.database_path(&identifier)?;

        let conn = Connection::open(&options.to_uri(&path))?;
        engine::register_functions(&conn)?;

        // A wrong key only shows once the engine reads the file.
        if let Err(e) = conn.exec(&bootstrap_sql()) {
            if let Err(close_err) = conn.close() {
                warn!(error = %close_err, "failed to close rejected connection");
            }
            warn!(identifier = %identifier, "bootstrap failed after open");
            return Err(CoreError::InvalidEncryptionKey(e.message));
        }

        info!(identifier = %identifier, "database mounted");
        self.conn = Some(conn);
        self.options = Some(options);
        self.identifier = Some(identifier);
        self.storage_dir = storage_dir;
        self.state = MountState::Mounted;
        Ok(())
    }

    /// Finalize every statement, close the connection and optionally persist.
    ///
    /// The core can be mounted again afterwards.
    pub async fn close(&mut self, save_after_close: bool) -> CoreResult<()> {
        match self.state {
            MountState::Mounted => {}
            MountState::Closed => return Err(CoreError::AlreadyClosed),
            MountState::Unmounted => return Err(CoreError::NotMounted),
        }

        self.statements.free_all();
        let closed = match self.conn.take() {
            Some(conn) => conn.close().map_err(CoreError::from),
            None => Ok(()),
        };

        let identifier = self.identifier.take();
        self.options = None;
        self.storage_dir = None;
        self.state = MountState::Closed;
        closed?;

        if save_after_close {
            self.flush(identifier.as_deref()).await?;
        }
        info!(identifier = identifier.as_deref().unwrap_or_default(), "database closed");
        Ok(())
    }

    /// Flush the storage backend. Safe to call repeatedly.
    pub async fn save_changes(&self) -> CoreResult<()> {
        self.flush(self.identifier.as_deref()).await
    }

    async fn flush(&self, identifier: Option<&str>) -> CoreResult<()> {
        if !self.storage.is_mounted() {
            return Ok(());
        }
        let file = identifier
            .map(|id| self.storage.database_path(id))
            .transpose()?;
        self.storage.sync(false, file.as_deref()).await?;
        Ok(())
    }

    /// Run `sql`, discarding rows.
    ///
    /// With params, `sql` must hold a single statement.
    pub fn run(&mut self, sql: &str, params: Option<&Params>) -> CoreResult<()> {
        let conn = self.conn()?;
        match params {
            Some(params) => {
                let stmt = conn.prepare(sql)?.ok_or(CoreError::NothingToPrepare)?;
                let mut stmt = StatementCore::new(stmt);
                stmt.bind(params)?;
                stmt.step()?;
                stmt.free()?;
            }
            None => conn.exec(sql)?,
        }
        Ok(())
    }

    /// Run every statement in `sql`, collecting one result per statement.
    pub fn execute(&mut self, sql: &str) -> CoreResult<Vec<ExecResult>> {
        let conn = self.conn()?;
        let mut results = Vec::new();
        let mut offset = 0;
        while offset < sql.len() {
            let (stmt, next) = conn.prepare_at(sql, offset)?;
            if next <= offset {
                break;
            }
            offset = next;
            let Some(stmt) = stmt else {
                continue;
            };

            let mut stmt = StatementCore::new(stmt);
            let mut result = ExecResult::default();
            while stmt.step()? {
                if result.values.is_empty() {
                    result.columns = stmt.column_names()?;
                }
                result.values.push(stmt.get(None)?);
            }
            stmt.free()?;
            results.push(result);
        }
        Ok(results)
    }

    /// Prepare `sql`, bind `params` if given, and register the statement.
    pub fn prepare(&mut self, sql: &str, params: Option<&Params>) -> CoreResult<StatementId> {
        let stmt = self.conn()?.prepare(sql)?.ok_or(CoreError::NothingToPrepare)?;
        let mut stmt = StatementCore::new(stmt);
        if let Some(params) = params {
            stmt.bind(params)?;
        }
        let id = self.statements.insert(stmt);
        debug!(statement_id = id, "statement prepared");
        Ok(id)
    }

    /// Look up a live statement.
    pub fn statement(&mut self, id: StatementId) -> CoreResult<&mut StatementCore> {
        self.statements.get_mut(id)
    }

    /// Finalize a statement and drop it from the registry.
    pub fn free_statement(&mut self, id: StatementId) -> CoreResult<bool> {
        self.statements.free(id)
    }

    pub fn live_statements(&self) -> usize {
        self.statements.len()
    }

    /// Produce a consistent image of the database file.
    ///
    /// Closes (saving), reads the file, then mounts again with the same
    /// options. Live statements do not survive.
    pub async fn export(&mut self, encoding: ExportEncoding) -> CoreResult<Exported> {
        if self.state != MountState::Mounted {
            return Err(CoreError::NotMounted);
        }
        let options = self.options.clone().unwrap_or_default();
        let identifier = self
            .identifier
            .clone()
            .unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string());
        let storage_dir = self.storage_dir.clone();

        self.close(true).await?;
        let read = match self.storage.database_path(&identifier) {
            Ok(path) => self.storage.read_file(&path).await,
            Err(e) => Err(e),
        };
        self.mount(options, Some(identifier.clone()), storage_dir)
            .await?;

        let bytes = read?;
        debug!(identifier = %identifier, bytes = bytes.len(), "database exported");
        Ok(match encoding {
            ExportEncoding::Binary => Exported::Binary(bytes),
            ExportEncoding::Utf8 => Exported::Utf8(String::from_utf8_lossy(&bytes).into_owned()),
        })
    }

    /// Delete the database file for `identifier`. The core must not be mounted.
    pub async fn wipe(&mut self, identifier: &str, storage_dir: Option<PathBuf>) -> CoreResult<()> {
        if self.state == MountState::Mounted {
            return Err(CoreError::StillMounted);
        }
        validate_identifier(identifier)?;

        self.storage.mount(storage_dir.as_deref()).await?;
        let path = self.storage.database_path(identifier)?;
        match self.storage.unlink(&path).await {
            Ok(()) => {}
            Err(StorageError::NotFound(p)) => {
                return Err(CoreError::DatabaseNotFound(format!(
                    "no such file: {}",
                    p.display()
                )))
            }
            Err(e) => return Err(e.into()),
        }
        self.flush(None).await?;
        info!(identifier = %identifier, "database wiped");
        Ok(())
    }

    /// Rows changed by the last INSERT, UPDATE or DELETE.
    pub fn rows_modified(&self) -> CoreResult<i64> {
        Ok(self.conn()?.changes())
    }
}
