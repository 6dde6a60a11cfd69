//! Caller-side statement proxy.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::database::{decode, ProxyInner};
use super::error::ClientResult;
use crate::core::{Row, StatementId};
use crate::value::{Params, Value};
use crate::worker::protocol::{CallEnvelope, StatementOp};

/// A prepared statement living in the worker, addressed by id.
///
/// Every call is routed to the statement rather than the database. Once the
/// statement is freed, or its database closed, calls fail with
/// `StatementClosed`.
#[derive(Debug, Clone)]
pub struct Statement {
    inner: Arc<ProxyInner>,
    id: StatementId,
}

impl Statement {
    pub(crate) fn new(inner: Arc<ProxyInner>, id: StatementId) -> Self {
        Self { inner, id }
    }

    pub fn id(&self) -> StatementId {
        self.id
    }

    /// Invoke any statement operation by name.
    pub async fn call(&self, operation: &str, arguments: Vec<JsonValue>) -> ClientResult<JsonValue> {
        self.inner
            .invoke(CallEnvelope::on_statement(self.id, operation, arguments))
            .await
    }

    async fn op(&self, op: StatementOp, arguments: Vec<JsonValue>) -> ClientResult<JsonValue> {
        self.call(op.as_str(), arguments).await
    }

    fn params_args(params: Option<&Params>) -> Vec<JsonValue> {
        params.map(|p| vec![p.to_json()]).unwrap_or_default()
    }

    pub async fn bind(&self, params: &Params) -> ClientResult<bool> {
        let output = self.op(StatementOp::Bind, vec![params.to_json()]).await?;
        decode(StatementOp::Bind.as_str(), output)
    }

    /// Advance one row. `false` once the statement is done.
    pub async fn step(&self) -> ClientResult<bool> {
        let output = self.op(StatementOp::Step, Vec::new()).await?;
        decode(StatementOp::Step.as_str(), output)
    }

    /// Values of the current row, binding and stepping first when `params` is given.
    pub async fn get(&self, params: Option<&Params>) -> ClientResult<Vec<Value>> {
        let output = self.op(StatementOp::Get, Self::params_args(params)).await?;
        decode(StatementOp::Get.as_str(), output)
    }

    pub async fn column_names(&self) -> ClientResult<Vec<String>> {
        let output = self.op(StatementOp::GetColumnNames, Vec::new()).await?;
        decode(StatementOp::GetColumnNames.as_str(), output)
    }

    /// Step to the end, returning every row keyed by column name.
    pub async fn get_as_object(&self) -> ClientResult<Vec<Row>> {
        let output = self.op(StatementOp::GetAsObject, Vec::new()).await?;
        decode(StatementOp::GetAsObject.as_str(), output)
    }

    pub async fn reset(&self) -> ClientResult<bool> {
        let output = self.op(StatementOp::Reset, Vec::new()).await?;
        decode(StatementOp::Reset.as_str(), output)
    }

    pub async fn free(&self) -> ClientResult<bool> {
        let output = self.op(StatementOp::Free, Vec::new()).await?;
        decode(StatementOp::Free.as_str(), output)
    }

    /// Bind, step once and reset, discarding any row.
    pub async fn run(&self, params: Option<&Params>) -> ClientResult<()> {
        self.op(StatementOp::Run, Self::params_args(params)).await?;
        Ok(())
    }
}
