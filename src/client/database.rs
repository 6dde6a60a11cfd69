//! Caller-side database proxy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::{oneshot, OnceCell};
use tracing::debug;

use super::error::{ClientError, ClientResult, RemoteError, TransportError};
use super::process::ProcessTransport;
use super::statement::Statement;
use super::transport::Transport;
use crate::config::{ConnectionOptions, Settings};
use crate::core::{ExecResult, ExportEncoding, Exported, StatementId};
use crate::storage::{DiskStorage, Storage};
use crate::value::Params;
use crate::worker::protocol::{CallEnvelope, DatabaseOp, ReplyEnvelope};
use crate::worker::WorkerHandle;

/// How a proxy talks to its worker.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Deadline for each call. `None` waits forever.
    pub call_timeout: Option<Duration>,

    /// The worker's connection may be used by other proxies. Teardown then
    /// saves instead of closing.
    pub shared: bool,
}

impl ClientOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            call_timeout: settings.call_timeout(),
            shared: settings.worker.shared,
        }
    }
}

/// State shared by a database proxy and every statement proxy it produced.
#[derive(Debug)]
pub(crate) struct ProxyInner {
    transport: Arc<dyn Transport>,
    constructed: OnceCell<()>,
    options: ClientOptions,
}

impl ProxyInner {
    async fn send(&self, call: CallEnvelope) -> ClientResult<JsonValue> {
        let operation = call.operation.clone();
        let (tx, rx) = oneshot::channel::<ReplyEnvelope>();
        self.transport.post(call, tx)?;

        let received = match self.options.call_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| TransportError::Timeout(limit))?,
            None => rx.await,
        };
        let reply = received.map_err(|_| match self.transport.failure() {
            Some(failure) => failure,
            None if self.transport.is_alive() => TransportError::ReplyChannelUnavailable,
            None => TransportError::WorkerExited,
        })?;

        match reply.error {
            Some(error) => {
                debug!(operation = %operation, error = %error.name, "remote call failed");
                Err(RemoteError::from(error).into())
            }
            None => Ok(reply.output),
        }
    }

    /// Issue the implicit `constructor` call once, however many first calls race.
    async fn ensure_constructed(&self) -> ClientResult<()> {
        self.constructed
            .get_or_try_init(|| async {
                self.send(CallEnvelope::constructor()).await.map(|_| ())
            })
            .await?;
        Ok(())
    }

    pub(crate) async fn invoke(&self, call: CallEnvelope) -> ClientResult<JsonValue> {
        self.ensure_constructed().await?;
        self.send(call).await
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if !self.constructed.initialized() || !self.transport.is_alive() {
            return;
        }
        let op = if self.options.shared {
            DatabaseOp::SaveChanges
        } else {
            DatabaseOp::Close
        };
        // Nobody waits for this reply.
        let (tx, _rx) = oneshot::channel();
        if self.transport.post(CallEnvelope::new(op.as_str(), Vec::new()), tx).is_ok() {
            debug!(operation = op.as_str(), "posted teardown call");
        }
    }
}

pub(crate) fn decode<T: DeserializeOwned>(operation: &str, output: JsonValue) -> ClientResult<T> {
    serde_json::from_value(output).map_err(|source| ClientError::Decode {
        operation: operation.to_string(),
        source,
    })
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> ClientResult<JsonValue> {
    serde_json::to_value(value).map_err(|e| TransportError::Serialize(e).into())
}

fn opt_json<T: Into<JsonValue>>(value: Option<T>) -> JsonValue {
    value.map(Into::into).unwrap_or(JsonValue::Null)
}

fn path_json(path: Option<&Path>) -> JsonValue {
    opt_json(path.map(|p| p.display().to_string()))
}

/// What a generic [`Database::invoke`] produced.
#[derive(Debug)]
pub enum Output {
    Value(JsonValue),
    /// `prepare` hands back a statement proxy instead of its id.
    Statement(Statement),
}

/// A database living in a worker.
///
/// Every method becomes one call to the worker and resolves with its reply.
/// Calls from one proxy reach the worker in the order they were made.
///
/// # Example
///
/// ```ignore
/// use sealed_sql::client::Database;
/// use sealed_sql::config::ConnectionOptions;
///
/// let db = Database::in_process(storage)?;
/// db.mount(&ConnectionOptions::new("secret"), Some("notes"), None).await?;
/// let stmt = db.prepare("SELECT ?", Some(&params![1])).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<ProxyInner>,
}

impl Database {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, ClientOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                transport,
                constructed: OnceCell::new(),
                options,
            }),
        }
    }

    /// Start a worker thread in this process and connect to it.
    pub fn in_process(storage: Arc<dyn Storage>) -> ClientResult<Self> {
        let worker = WorkerHandle::spawn(storage)?;
        Ok(Self::new(Arc::new(worker)))
    }

    /// Start a `sealed-sql worker` child process and connect to it.
    pub async fn spawn_process(settings: &Settings) -> ClientResult<Self> {
        let transport = ProcessTransport::spawn_with_settings(settings).await?;
        Ok(Self::with_options(
            Arc::new(transport),
            ClientOptions::from_settings(settings),
        ))
    }

    /// Connect as `settings` describe: a child process when `worker.path` is
    /// set, a worker thread otherwise.
    pub async fn connect(settings: &Settings) -> ClientResult<Self> {
        if settings.worker.path.is_some() {
            return Self::spawn_process(settings).await;
        }
        let storage_dir = settings.storage_dir()?;
        let storage: Arc<dyn Storage> = match storage_dir {
            Some(dir) => Arc::new(DiskStorage::with_default_root(dir)),
            None => Arc::new(DiskStorage::new()),
        };
        let worker = WorkerHandle::spawn(storage)?;
        Ok(Self::with_options(
            Arc::new(worker),
            ClientOptions::from_settings(settings),
        ))
    }

    async fn call(&self, op: DatabaseOp, arguments: Vec<JsonValue>) -> ClientResult<JsonValue> {
        self.inner
            .invoke(CallEnvelope::new(op.as_str(), arguments))
            .await
    }

    pub(crate) fn statement(&self, id: StatementId) -> Statement {
        Statement::new(Arc::clone(&self.inner), id)
    }

    /// Invoke any operation by name, remapping `prepare` into a statement proxy.
    ///
    /// Names outside the database whitelist are rejected by the worker.
    pub async fn invoke(&self, operation: &str, arguments: Vec<JsonValue>) -> ClientResult<Output> {
        let output = self
            .inner
            .invoke(CallEnvelope::new(operation, arguments))
            .await?;
        if operation == DatabaseOp::Prepare.as_str() {
            let id: StatementId = decode(operation, output)?;
            return Ok(Output::Statement(self.statement(id)));
        }
        Ok(Output::Value(output))
    }

    pub async fn mount(
        &self,
        options: &ConnectionOptions,
        identifier: Option<&str>,
        storage_dir: Option<&Path>,
    ) -> ClientResult<()> {
        let args = vec![encode(options)?, opt_json(identifier), path_json(storage_dir)];
        self.call(DatabaseOp::Mount, args).await?;
        Ok(())
    }

    /// Close the connection, saving afterwards when `save` is set.
    pub async fn close(&self, save: bool) -> ClientResult<()> {
        self.call(DatabaseOp::Close, vec![JsonValue::Bool(save)]).await?;
        Ok(())
    }

    pub async fn run(&self, sql: &str, params: Option<&Params>) -> ClientResult<()> {
        let args = vec![sql.into(), opt_json(params.map(Params::to_json))];
        self.call(DatabaseOp::Run, args).await?;
        Ok(())
    }

    /// Run every statement in `sql` and collect one result per statement.
    pub async fn execute(&self, sql: &str) -> ClientResult<Vec<ExecResult>> {
        let output = self.call(DatabaseOp::Execute, vec![sql.into()]).await?;
        decode(DatabaseOp::Execute.as_str(), output)
    }

    pub async fn prepare(&self, sql: &str, params: Option<&Params>) -> ClientResult<Statement> {
        let args = vec![sql.into(), opt_json(params.map(Params::to_json))];
        let output = self.call(DatabaseOp::Prepare, args).await?;
        let id: StatementId = decode(DatabaseOp::Prepare.as_str(), output)?;
        Ok(self.statement(id))
    }

    /// Snapshot the database file. The worker closes and remounts to do it.
    pub async fn export(&self, encoding: ExportEncoding) -> ClientResult<Exported> {
        let output = self
            .call(DatabaseOp::Export, vec![encode(&encoding)?])
            .await?;
        let op = DatabaseOp::Export.as_str();
        match encoding {
            ExportEncoding::Binary => decode(op, output).map(Exported::Binary),
            ExportEncoding::Utf8 => decode(op, output).map(Exported::Utf8),
        }
    }

    /// Delete the database file for `identifier`. Fails while mounted.
    pub async fn wipe(&self, identifier: &str, storage_dir: Option<&Path>) -> ClientResult<()> {
        self.call(DatabaseOp::Wipe, vec![identifier.into(), path_json(storage_dir)])
            .await?;
        Ok(())
    }

    pub async fn save_changes(&self) -> ClientResult<()> {
        self.call(DatabaseOp::SaveChanges, Vec::new()).await?;
        Ok(())
    }

    pub async fn rows_modified(&self) -> ClientResult<i64> {
        let output = self.call(DatabaseOp::GetRowsModified, Vec::new()).await?;
        decode(DatabaseOp::GetRowsModified.as_str(), output)
    }

    pub async fn is_open(&self) -> ClientResult<bool> {
        let output = self.call(DatabaseOp::IsOpen, Vec::new()).await?;
        decode(DatabaseOp::IsOpen.as_str(), output)
    }

    /// The raw transport, bypassing the call protocol.
    pub fn worker(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    /// Stop the worker. Outstanding and later calls fail.
    pub fn terminate(&self) {
        self.inner.transport.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records calls and answers each with `null`.
    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<CallEnvelope>>,
    }

    impl Transport for Recorder {
        fn post(
            &self,
            call: CallEnvelope,
            reply_to: oneshot::Sender<ReplyEnvelope>,
        ) -> Result<(), TransportError> {
            let output = if call.operation == "prepare" {
                JsonValue::from(7)
            } else {
                JsonValue::Null
            };
            self.calls.lock().unwrap().push(call);
            let _ = reply_to.send(ReplyEnvelope::ok(output));
            Ok(())
        }

        fn terminate(&self) {}

        fn is_alive(&self) -> bool {
            true
        }
    }

    fn operations(recorder: &Recorder) -> Vec<String> {
        recorder
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.operation.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_constructor_precedes_first_call_only() {
        let recorder = Arc::new(Recorder::default());
        let db = Database::new(recorder.clone());
        db.save_changes().await.unwrap();
        db.save_changes().await.unwrap();
        assert_eq!(operations(&recorder), ["constructor", "saveChanges", "saveChanges"]);
    }

    #[tokio::test]
    async fn test_invoke_remaps_prepare() {
        let recorder = Arc::new(Recorder::default());
        let db = Database::new(recorder.clone());
        match db.invoke("prepare", vec!["SELECT 1".into()]).await.unwrap() {
            Output::Statement(stmt) => assert_eq!(stmt.id(), 7),
            other => panic!("expected a statement, got {:?}", other),
        }
        assert!(matches!(
            db.invoke("isOpen", vec![]).await.unwrap(),
            Output::Value(JsonValue::Null)
        ));
    }

    #[tokio::test]
    async fn test_teardown_closes_sole_connection() {
        let recorder = Arc::new(Recorder::default());
        {
            let db = Database::new(recorder.clone());
            db.run("SELECT 1", None).await.unwrap();
        }
        assert_eq!(operations(&recorder), ["constructor", "run", "close"]);
    }

    #[tokio::test]
    async fn test_teardown_saves_shared_connection() {
        let recorder = Arc::new(Recorder::default());
        {
            let options = ClientOptions {
                shared: true,
                ..Default::default()
            };
            let db = Database::with_options(recorder.clone(), options);
            db.save_changes().await.unwrap();
        }
        assert_eq!(
            operations(&recorder),
            ["constructor", "saveChanges", "saveChanges"]
        );
    }

    #[tokio::test]
    async fn test_unconstructed_proxy_posts_nothing_on_drop() {
        let recorder = Arc::new(Recorder::default());
        drop(Database::new(recorder.clone()));
        assert!(operations(&recorder).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_reply_reports_transport_failure() {
        #[derive(Debug)]
        struct BrokenPipe;

        impl Transport for BrokenPipe {
            fn post(
                &self,
                _call: CallEnvelope,
                _reply_to: oneshot::Sender<ReplyEnvelope>,
            ) -> Result<(), TransportError> {
                Ok(())
            }

            fn terminate(&self) {}

            fn is_alive(&self) -> bool {
                false
            }

            fn failure(&self) -> Option<TransportError> {
                Some(TransportError::WriteFailed(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                )))
            }
        }

        let db = Database::new(Arc::new(BrokenPipe));
        let err = db.save_changes().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::WriteFailed(ref e)) if e.kind() == std::io::ErrorKind::BrokenPipe
        ));
    }
}
