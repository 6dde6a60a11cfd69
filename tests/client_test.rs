//! Integration tests for the caller-side proxies and transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value as JsonValue;
use tempfile::TempDir;
use tokio::sync::oneshot;

use sealed_sql::client::{
    ClientError, ClientOptions, Database, ErrorKind, ProcessTransport, Transport, TransportError,
};
use sealed_sql::config::ConnectionOptions;
use sealed_sql::core::{ExportEncoding, Exported};
use sealed_sql::params;
use sealed_sql::storage::DiskStorage;
use sealed_sql::value::Value;
use sealed_sql::worker::protocol::{CallEnvelope, ReplyEnvelope};

fn in_process(dir: &TempDir) -> Database {
    Database::in_process(Arc::new(DiskStorage::with_default_root(dir.path()))).unwrap()
}

async fn mounted(dir: &TempDir) -> Database {
    let db = in_process(dir);
    db.mount(&ConnectionOptions::new("client-key"), Some("main"), None)
        .await
        .unwrap();
    db
}

/// Answers every call with `null` a little later, counting constructors.
#[derive(Debug, Default)]
struct Deferred {
    constructors: AtomicUsize,
    operations: Mutex<Vec<String>>,
}

impl Transport for Deferred {
    fn post(
        &self,
        call: CallEnvelope,
        reply_to: oneshot::Sender<ReplyEnvelope>,
    ) -> Result<(), TransportError> {
        if call.is_constructor() {
            self.constructors.fetch_add(1, Ordering::SeqCst);
        }
        self.operations.lock().unwrap().push(call.operation);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = reply_to.send(ReplyEnvelope::ok(JsonValue::Null));
        });
        Ok(())
    }

    fn terminate(&self) {}

    fn is_alive(&self) -> bool {
        true
    }
}

/// Accepts calls and never answers.
#[derive(Debug, Default)]
struct Silent {
    held: Mutex<Vec<oneshot::Sender<ReplyEnvelope>>>,
}

impl Transport for Silent {
    fn post(
        &self,
        _call: CallEnvelope,
        reply_to: oneshot::Sender<ReplyEnvelope>,
    ) -> Result<(), TransportError> {
        self.held.lock().unwrap().push(reply_to);
        Ok(())
    }

    fn terminate(&self) {}

    fn is_alive(&self) -> bool {
        true
    }
}

// ============================================================================
// Proxy protocol
// ============================================================================

#[tokio::test]
async fn test_concurrent_first_calls_construct_once() {
    let transport = Arc::new(Deferred::default());
    let db = Database::new(transport.clone());

    let calls = (0..8).map(|_| db.save_changes());
    for result in join_all(calls).await {
        result.unwrap();
    }

    assert_eq!(transport.constructors.load(Ordering::SeqCst), 1);
    let operations = transport.operations.lock().unwrap().clone();
    assert_eq!(operations.len(), 9);
    assert_eq!(operations[0], "constructor");
    assert!(operations[1..].iter().all(|op| op == "saveChanges"));
}

#[tokio::test]
async fn test_silent_worker_times_out() {
    let options = ClientOptions {
        call_timeout: Some(Duration::from_millis(50)),
        shared: false,
    };
    let db = Database::with_options(Arc::new(Silent::default()), options);

    let err = db.is_open().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::Timeout(d)) if d == Duration::from_millis(50)
    ));
}

#[tokio::test]
async fn test_dropped_reply_channel_is_reported() {
    #[derive(Debug)]
    struct Dropper;

    impl Transport for Dropper {
        fn post(
            &self,
            _call: CallEnvelope,
            _reply_to: oneshot::Sender<ReplyEnvelope>,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn terminate(&self) {}

        fn is_alive(&self) -> bool {
            true
        }
    }

    let db = Database::new(Arc::new(Dropper));
    let err = db.is_open().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::ReplyChannelUnavailable)
    ));
}

// ============================================================================
// In-process worker
// ============================================================================

#[tokio::test]
async fn test_unawaited_calls_are_dispatched_in_order() {
    let dir = TempDir::new().unwrap();
    let db = mounted(&dir).await;
    db.run("CREATE TABLE log(n INTEGER)", None).await.unwrap();

    let inserts: Vec<_> = (0..30).map(|n| params![n]).collect();
    let calls = inserts
        .iter()
        .map(|p| db.run("INSERT INTO log VALUES (?)", Some(p)));
    for result in join_all(calls).await {
        result.unwrap();
    }

    let results = db.execute("SELECT n FROM log ORDER BY rowid").await.unwrap();
    let seen: Vec<Value> = results[0].values.iter().map(|row| row[0].clone()).collect();
    let expected: Vec<Value> = (0..30).map(Value::Integer).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_remote_errors_keep_their_kind() {
    let dir = TempDir::new().unwrap();
    let db = mounted(&dir).await;

    let err = db
        .mount(&ConnectionOptions::new("client-key"), Some("main"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::AlreadyMounted));
    let remote = err.remote().unwrap();
    assert_eq!(remote.message, "Database is already mounted");
    assert!(remote.stack.as_deref().unwrap().contains("MountError"));

    let err = db.execute("SELEC nonsense").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Engine));
    assert!(err.to_string().starts_with("EngineError: "));
}

#[tokio::test]
async fn test_statement_proxy_lifecycle() {
    let dir = TempDir::new().unwrap();
    let db = mounted(&dir).await;
    db.execute("CREATE TABLE t(name TEXT, score REAL); INSERT INTO t VALUES ('a', 1.5), ('b', 2.5);")
        .await
        .unwrap();

    let stmt = db
        .prepare("SELECT name, score FROM t WHERE score > ? ORDER BY name", Some(&params![0]))
        .await
        .unwrap();
    assert!(stmt.step().await.unwrap());
    assert_eq!(stmt.column_names().await.unwrap(), ["name", "score"]);
    assert_eq!(
        stmt.get(None).await.unwrap(),
        vec![Value::Text("a".into()), Value::Real(1.5)]
    );

    let rows = stmt.get_as_object().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], Value::Text("b".into()));

    assert!(stmt.reset().await.unwrap());
    let row = stmt.get(Some(&params![2])).await.unwrap();
    assert_eq!(row[0], Value::Text("b".into()));

    assert!(stmt.free().await.unwrap());
    let err = stmt.step().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::StatementClosed));
}

#[tokio::test]
async fn test_close_invalidates_statement_proxies() {
    let dir = TempDir::new().unwrap();
    let db = mounted(&dir).await;
    let stmt = db.prepare("SELECT 1", None).await.unwrap();

    db.close(true).await.unwrap();
    assert!(!db.is_open().await.unwrap());
    let err = stmt.get(None).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::StatementClosed));
}

#[tokio::test]
async fn test_export_and_wipe_through_proxy() {
    let dir = TempDir::new().unwrap();
    let db = mounted(&dir).await;
    db.run("CREATE TABLE t(x); INSERT INTO t VALUES (1);", None)
        .await
        .unwrap();

    match db.export(ExportEncoding::Binary).await.unwrap() {
        Exported::Binary(bytes) => assert!(!bytes.is_empty()),
        other => panic!("expected bytes, got {:?}", other),
    }
    assert!(db.is_open().await.unwrap());

    let err = db.wipe("main", None).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::StillMounted));

    db.close(true).await.unwrap();
    db.wipe("main", None).await.unwrap();
    let err = db.wipe("main", None).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::DatabaseNotFound));
}

#[tokio::test]
async fn test_terminated_worker_rejects_calls() {
    let dir = TempDir::new().unwrap();
    let db = mounted(&dir).await;

    db.terminate();
    assert!(!db.worker().is_alive());
    let err = db.is_open().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::WorkerExited)
    ));
}

// ============================================================================
// Child-process worker
// ============================================================================

#[tokio::test]
async fn test_child_process_worker_round_trip() {
    let dir = TempDir::new().unwrap();
    let args = vec![
        "worker".to_string(),
        "--storage-dir".to_string(),
        dir.path().display().to_string(),
    ];
    let transport = ProcessTransport::spawn(env!("CARGO_BIN_EXE_sealed-sql"), &args)
        .await
        .unwrap();
    let db = Database::new(Arc::new(transport));

    db.mount(&ConnectionOptions::new("child-key"), Some("child"), None)
        .await
        .unwrap();
    let results = db.execute("SELECT 40 + 2 AS answer").await.unwrap();
    assert_eq!(results[0].columns, ["answer"]);
    assert_eq!(results[0].values, vec![vec![Value::Integer(42)]]);

    let stmt = db.prepare("SELECT ?", Some(&params![vec![7u8, 8]])).await.unwrap();
    assert!(stmt.step().await.unwrap());
    assert_eq!(stmt.get(None).await.unwrap(), vec![Value::Blob(vec![7, 8])]);
    assert!(stmt.free().await.unwrap());
    db.close(true).await.unwrap();
    assert!(dir.path().join("child.db").exists());

    db.terminate();
    assert!(!db.worker().is_alive());
}
