//! Routes calls to whitelisted database and statement operations.

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::protocol::{CallEnvelope, DatabaseOp, ErrorDescriptor, ReplyEnvelope, StatementOp};
use crate::config::ConnectionOptions;
use crate::core::{
    CoreError, CoreResult, DatabaseCore, ExportEncoding, Exported, StatementId,
};
use crate::storage::Storage;
use crate::value::{MarshalError, Params, Value};

/// Positional call arguments, with `null` treated as absent.
struct Args<'a> {
    operation: &'a str,
    values: &'a [JsonValue],
}

impl<'a> Args<'a> {
    fn new(operation: &'a str, values: &'a [JsonValue]) -> Self {
        Self { operation, values }
    }

    fn get(&self, index: usize) -> Option<&'a JsonValue> {
        self.values.get(index).filter(|v| !v.is_null())
    }

    fn string(&self, index: usize, what: &str) -> CoreResult<String> {
        self.opt_string(index)?.ok_or_else(|| {
            CoreError::invalid_arguments(self.operation, format!("{} is required", what))
        })
    }

    fn opt_string(&self, index: usize) -> CoreResult<Option<String>> {
        self.opt::<String>(index)
    }

    fn opt<T: DeserializeOwned>(&self, index: usize) -> CoreResult<Option<T>> {
        self.get(index)
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| {
                    CoreError::invalid_arguments(
                        self.operation,
                        format!("argument {}: {}", index + 1, e),
                    )
                })
            })
            .transpose()
    }

    fn opt_params(&self, index: usize) -> CoreResult<Option<Params>> {
        Ok(self.get(index).map(Params::from_json).transpose()?)
    }

    fn params(&self, index: usize) -> CoreResult<Params> {
        self.opt_params(index)?
            .ok_or_else(|| MarshalError::UnknownParams("undefined".to_string()).into())
    }
}

fn to_json<T: serde::Serialize>(operation: &str, value: T) -> CoreResult<JsonValue> {
    serde_json::to_value(value)
        .map_err(|e| CoreError::Internal(format!("could not encode output of {}: {}", operation, e)))
}

fn values_json(values: Vec<Value>) -> JsonValue {
    JsonValue::Array(values.iter().map(Value::to_json).collect())
}

/// Reject a name that is not in the whitelist for its target.
fn reject(name: &str, on_statement: bool) -> CoreError {
    let in_other = if on_statement {
        DatabaseOp::from_name(name).is_some()
    } else {
        StatementOp::from_name(name).is_some()
    };
    if in_other {
        CoreError::OperationNotWhitelisted(name.to_string())
    } else {
        CoreError::UnknownOperation(name.to_string())
    }
}

/// Resolves one call at a time against the worker's single database core.
///
/// The core is created by the first `constructor` call and lives as long as
/// the dispatcher. Every failure becomes the error half of the reply.
#[derive(Debug)]
pub struct SequentialDispatcher {
    storage: Arc<dyn Storage>,
    database: Option<DatabaseCore>,
}

impl SequentialDispatcher {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            database: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.database.is_some()
    }

    pub fn database(&self) -> Option<&DatabaseCore> {
        self.database.as_ref()
    }

    /// Dispatch one call and produce its reply.
    pub async fn dispatch(&mut self, call: CallEnvelope) -> ReplyEnvelope {
        if call.is_constructor() {
            if self.database.is_none() {
                debug!("creating database core");
                self.database = Some(DatabaseCore::new(Arc::clone(&self.storage)));
            }
            return ReplyEnvelope::ok(JsonValue::Null);
        }

        debug!(operation = %call.operation, statement_id = ?call.statement_id, "dispatching call");
        match self.invoke(&call).await {
            Ok(output) => ReplyEnvelope::ok(output),
            Err(err) => {
                debug!(operation = %call.operation, error = %err, "call failed");
                ReplyEnvelope::err(ErrorDescriptor::from_core(&err, &call.operation))
            }
        }
    }

    async fn invoke(&mut self, call: &CallEnvelope) -> CoreResult<JsonValue> {
        let args = Args::new(&call.operation, &call.arguments);
        match call.statement_id {
            Some(id) => {
                let op = StatementOp::from_name(&call.operation)
                    .ok_or_else(|| reject(&call.operation, true))?;
                let db = self.database.as_mut().ok_or(CoreError::NotInitialized)?;
                invoke_statement(db, id, op, &args)
            }
            None => {
                let op = DatabaseOp::from_name(&call.operation)
                    .ok_or_else(|| reject(&call.operation, false))?;
                let db = self.database.as_mut().ok_or(CoreError::NotInitialized)?;
                invoke_database(db, op, &args).await
            }
        }
    }
}

async fn invoke_database(
    db: &mut DatabaseCore,
    op: DatabaseOp,
    args: &Args<'_>,
) -> CoreResult<JsonValue> {
    let name = op.as_str();
    match op {
        DatabaseOp::Mount => {
            let options = args.opt::<ConnectionOptions>(0)?.unwrap_or_default();
            let identifier = args.opt_string(1)?;
            let storage_dir = args.opt_string(2)?.map(PathBuf::from);
            db.mount(options, identifier, storage_dir).await?;
            Ok(JsonValue::Null)
        }
        DatabaseOp::Close => {
            let save = args.opt::<bool>(0)?.unwrap_or(true);
            db.close(save).await?;
            Ok(JsonValue::Null)
        }
        DatabaseOp::Run => {
            let sql = args.string(0, "sql")?;
            db.run(&sql, args.opt_params(1)?.as_ref())?;
            Ok(JsonValue::Null)
        }
        DatabaseOp::Execute => {
            let sql = args.string(0, "sql")?;
            to_json(name, db.execute(&sql)?)
        }
        DatabaseOp::Prepare => {
            let sql = args.string(0, "sql")?;
            let id = db.prepare(&sql, args.opt_params(1)?.as_ref())?;
            Ok(JsonValue::from(id))
        }
        DatabaseOp::Export => {
            let encoding = args.opt::<ExportEncoding>(0)?.unwrap_or_default();
            match db.export(encoding).await? {
                Exported::Binary(bytes) => Ok(Value::Blob(bytes).to_json()),
                Exported::Utf8(text) => Ok(JsonValue::String(text)),
            }
        }
        DatabaseOp::Wipe => {
            let identifier = args.string(0, "identifier")?;
            let storage_dir = args.opt_string(1)?.map(PathBuf::from);
            db.wipe(&identifier, storage_dir).await?;
            Ok(JsonValue::Null)
        }
        DatabaseOp::SaveChanges => {
            db.save_changes().await?;
            Ok(JsonValue::Null)
        }
        DatabaseOp::GetRowsModified => Ok(JsonValue::from(db.rows_modified()?)),
        DatabaseOp::IsOpen => Ok(JsonValue::Bool(db.is_open())),
    }
}

fn invoke_statement(
    db: &mut DatabaseCore,
    id: StatementId,
    op: StatementOp,
    args: &Args<'_>,
) -> CoreResult<JsonValue> {
    match op {
        StatementOp::Free => Ok(JsonValue::Bool(db.free_statement(id)?)),
        StatementOp::Bind => Ok(JsonValue::Bool(db.statement(id)?.bind(&args.params(0)?)?)),
        StatementOp::Step => Ok(JsonValue::Bool(db.statement(id)?.step()?)),
        StatementOp::Get => {
            let stmt = db.statement(id)?;
            Ok(values_json(stmt.get(args.opt_params(0)?.as_ref())?))
        }
        StatementOp::GetColumnNames => to_json(op.as_str(), db.statement(id)?.column_names()?),
        StatementOp::GetAsObject => to_json(op.as_str(), db.statement(id)?.get_as_object()?),
        StatementOp::Reset => Ok(JsonValue::Bool(db.statement(id)?.reset()?)),
        StatementOp::Run => {
            let stmt = db.statement(id)?;
            stmt.run(args.opt_params(0)?.as_ref())?;
            Ok(JsonValue::Null)
        }
    }
}
