//! Integration tests for call routing and the serial worker loop.

use std::sync::Arc;

use insta::assert_snapshot;
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use sealed_sql::storage::DiskStorage;
use sealed_sql::worker::protocol::{CallEnvelope, DatabaseOp, ReplyEnvelope, StatementOp};
use sealed_sql::worker::{serve, QueuedCall, SequentialDispatcher};

fn dispatcher() -> SequentialDispatcher {
    SequentialDispatcher::new(Arc::new(DiskStorage::new()))
}

fn mount_call(dir: &TempDir) -> CallEnvelope {
    CallEnvelope::new(
        "mount",
        vec![
            json!({"key": "k"}),
            json!("main"),
            json!(dir.path().display().to_string()),
        ],
    )
}

async fn mounted(dir: &TempDir) -> SequentialDispatcher {
    let mut d = dispatcher();
    assert!(d.dispatch(CallEnvelope::constructor()).await.is_ok());
    let reply = d.dispatch(mount_call(dir)).await;
    assert!(reply.is_ok(), "mount failed: {:?}", reply.error);
    d
}

fn wire(reply: &ReplyEnvelope) -> String {
    serde_json::to_string(reply).unwrap()
}

fn error_line(reply: &ReplyEnvelope) -> String {
    let error = reply.error.as_ref().expect("expected an error reply");
    format!("{}: {}", error.name, error.message)
}

// ============================================================================
// Whitelists
// ============================================================================

#[tokio::test]
async fn test_unlisted_names_never_reach_the_engine() {
    let dir = TempDir::new().unwrap();
    let mut d = mounted(&dir).await;
    d.dispatch(CallEnvelope::new("prepare", vec![json!("SELECT 1")]))
        .await;

    let names = [
        "__proto__",
        "toString",
        "constructor ",
        "exec",
        "",
        "MOUNT",
        "then",
    ];
    for name in names {
        for call in [
            CallEnvelope::new(name, vec![json!("DROP TABLE _sealed_metadata")]),
            CallEnvelope::on_statement(1, name, vec![]),
        ] {
            let reply = d.dispatch(call).await;
            let error = reply.error.expect("rejected");
            assert_eq!(error.name, "UnknownOperation", "name {:?}", name);
            assert!(error.stack.unwrap().contains("(DispatchError)"));
        }
    }

    // The metadata table survived every attempt.
    let reply = d
        .dispatch(CallEnvelope::new(
            "execute",
            vec![json!("SELECT count(*) FROM _sealed_metadata")],
        ))
        .await;
    assert!(reply.is_ok());
}

#[tokio::test]
async fn test_operations_on_the_wrong_target_are_not_allowed() {
    let dir = TempDir::new().unwrap();
    let mut d = mounted(&dir).await;

    for op in StatementOp::ALL {
        if DatabaseOp::from_name(op.as_str()).is_some() {
            continue;
        }
        let reply = d.dispatch(CallEnvelope::new(op.as_str(), vec![])).await;
        assert_eq!(reply.error.unwrap().name, "OperationNotWhitelisted");
    }
    for op in DatabaseOp::ALL {
        if StatementOp::from_name(op.as_str()).is_some() {
            continue;
        }
        let reply = d
            .dispatch(CallEnvelope::on_statement(1, op.as_str(), vec![]))
            .await;
        assert_eq!(reply.error.unwrap().name, "OperationNotWhitelisted");
    }

    let reply = d.dispatch(CallEnvelope::new("step", vec![])).await;
    assert_snapshot!(error_line(&reply), @r#"OperationNotWhitelisted: "step" is not allowed from the proxy"#);
}

#[tokio::test]
async fn test_rejection_precedes_initialization() {
    let mut d = dispatcher();
    let reply = d.dispatch(CallEnvelope::new("__proto__", vec![])).await;
    assert_eq!(reply.error.unwrap().name, "UnknownOperation");

    let reply = d.dispatch(CallEnvelope::new("execute", vec![json!("SELECT 1")])).await;
    assert_snapshot!(error_line(&reply), @"NotInitialized: Database is not initialized, call the constructor first");
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_database_operations_reply_shapes() {
    let dir = TempDir::new().unwrap();
    let mut d = mounted(&dir).await;

    let reply = d
        .dispatch(CallEnvelope::new("execute", vec![json!("SELECT 1 AS a, 'x' AS b")]))
        .await;
    assert_snapshot!(wire(&reply), @r#"{"error":false,"output":[{"columns":["a","b"],"values":[[1,"x"]]}]}"#);

    let reply = d
        .dispatch(CallEnvelope::new(
            "run",
            vec![json!("CREATE TABLE t(x)")],
        ))
        .await;
    assert_snapshot!(wire(&reply), @r#"{"error":false,"output":null}"#);

    let reply = d
        .dispatch(CallEnvelope::new(
            "run",
            vec![json!("INSERT INTO t VALUES (?), (?)"), json!([1, 2])],
        ))
        .await;
    assert!(reply.is_ok());
    let reply = d.dispatch(CallEnvelope::new("getRowsModified", vec![])).await;
    assert_eq!(reply.output, json!(2));

    let reply = d.dispatch(CallEnvelope::new("isOpen", vec![])).await;
    assert_eq!(reply.output, json!(true));

    let reply = d.dispatch(CallEnvelope::new("mount", vec![json!({"key": "k"})])).await;
    assert_snapshot!(error_line(&reply), @"AlreadyMounted: Database is already mounted");
}

#[tokio::test]
async fn test_statement_lifecycle_over_calls() {
    let dir = TempDir::new().unwrap();
    let mut d = mounted(&dir).await;

    let reply = d
        .dispatch(CallEnvelope::new(
            "prepare",
            vec![json!("SELECT ? AS n, ? AS s, ? AS b"), json!([2.5, "hi", [1, 2, 3]])],
        ))
        .await;
    let id = reply.output.as_i64().expect("statement id");

    let step = d.dispatch(CallEnvelope::on_statement(id, "step", vec![])).await;
    assert_eq!(step.output, json!(true));

    let names = d
        .dispatch(CallEnvelope::on_statement(id, "getColumnNames", vec![]))
        .await;
    assert_eq!(names.output, json!(["n", "s", "b"]));

    let row = d.dispatch(CallEnvelope::on_statement(id, "get", vec![])).await;
    assert_snapshot!(wire(&row), @r#"{"error":false,"output":[2.5,"hi",[1,2,3]]}"#);

    let objects = d
        .dispatch(CallEnvelope::on_statement(
            id,
            "getAsObject",
            vec![],
        ))
        .await;
    assert!(objects.is_ok());

    let reset = d.dispatch(CallEnvelope::on_statement(id, "reset", vec![])).await;
    assert_eq!(reset.output, json!(true));

    let bad_bind = d
        .dispatch(CallEnvelope::on_statement(id, "bind", vec![json!(5)]))
        .await;
    assert_eq!(bad_bind.error.unwrap().name, "UnknownBindType");

    let freed = d.dispatch(CallEnvelope::on_statement(id, "free", vec![])).await;
    assert_eq!(freed.output, json!(true));

    let after = d.dispatch(CallEnvelope::on_statement(id, "step", vec![])).await;
    assert_snapshot!(error_line(&after), @"StatementClosed: Statement closed");

    let freed_again = d.dispatch(CallEnvelope::on_statement(id, "free", vec![])).await;
    assert_eq!(freed_again.error.unwrap().name, "StatementClosed");
    let bad_args = d
        .dispatch(CallEnvelope::on_statement(id, "get", vec![json!({"nested": {}})]))
        .await;
    assert_eq!(bad_args.error.unwrap().name, "StatementClosed");

    let unknown = d
        .dispatch(CallEnvelope::on_statement(id + 50, "step", vec![]))
        .await;
    assert_eq!(unknown.error.unwrap().name, "UnknownStatementId");
}

#[tokio::test]
async fn test_close_invalidates_statements_over_calls() {
    let dir = TempDir::new().unwrap();
    let mut d = mounted(&dir).await;

    let id = d
        .dispatch(CallEnvelope::new("prepare", vec![json!("SELECT 1")]))
        .await
        .output
        .as_i64()
        .unwrap();
    assert!(d.dispatch(CallEnvelope::new("close", vec![])).await.is_ok());

    let reply = d.dispatch(CallEnvelope::on_statement(id, "get", vec![])).await;
    assert_eq!(reply.error.unwrap().name, "StatementClosed");
    let reply = d.dispatch(CallEnvelope::new("close", vec![])).await;
    assert_eq!(reply.error.unwrap().name, "AlreadyClosed");
}

#[tokio::test]
async fn test_export_encodings_over_calls() {
    let dir = TempDir::new().unwrap();
    let mut d = mounted(&dir).await;

    let binary = d.dispatch(CallEnvelope::new("export", vec![])).await;
    let bytes = binary.output.as_array().expect("byte array");
    assert!(!bytes.is_empty());
    assert!(bytes.iter().all(|b| b.as_u64().is_some_and(|b| b <= 255)));

    let text = d
        .dispatch(CallEnvelope::new("export", vec![json!("utf8")]))
        .await;
    assert!(text.output.is_string());

    let bogus = d
        .dispatch(CallEnvelope::new("export", vec![json!("base64")]))
        .await;
    assert_eq!(bogus.error.unwrap().name, "InvalidArguments");
}

// ============================================================================
// Worker loop
// ============================================================================

fn post(
    tx: &mpsc::UnboundedSender<QueuedCall>,
    call: CallEnvelope,
) -> oneshot::Receiver<ReplyEnvelope> {
    let (reply_to, rx) = oneshot::channel();
    tx.send(QueuedCall { call, reply_to }).unwrap();
    rx
}

#[tokio::test]
async fn test_worker_loop_preserves_submission_order() {
    let dir = TempDir::new().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let (_kill_tx, kill_rx) = oneshot::channel();

    let mut replies = vec![
        post(&tx, CallEnvelope::constructor()),
        post(&tx, mount_call(&dir)),
        post(&tx, CallEnvelope::new("run", vec![json!("CREATE TABLE log(n)")])),
    ];
    for n in 0..25 {
        replies.push(post(
            &tx,
            CallEnvelope::new("run", vec![json!("INSERT INTO log VALUES (?)"), json!([n])]),
        ));
    }
    let select = post(
        &tx,
        CallEnvelope::new("execute", vec![json!("SELECT n FROM log ORDER BY rowid")]),
    );
    drop(tx);

    serve(rx, dispatcher(), async {}, kill_rx).await;

    for reply in replies {
        assert!(reply.await.unwrap().is_ok());
    }
    let output = select.await.unwrap().output;
    let values: Vec<JsonValue> = (0..25).map(|n| json!([n])).collect();
    assert_eq!(output[0]["values"], JsonValue::Array(values));
}

#[tokio::test]
async fn test_kill_drops_queued_calls() {
    let (tx, rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel();

    kill_tx.send(()).unwrap();
    let pending = post(&tx, CallEnvelope::constructor());
    // Never ready, so nothing is dispatched before the kill is seen.
    serve(rx, dispatcher(), std::future::pending::<()>(), kill_rx).await;

    assert!(pending.await.is_err());
}
