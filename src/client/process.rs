//! Child-process transport: a `sealed-sql worker` speaking NDJSON frames.
//!
//! Each call gets a fresh uuid. The reply frame echoes it, and the reader task
//! hands the reply to whichever caller registered that id.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::TransportError;
use super::transport::Transport;
use crate::config::Settings;
use crate::worker::protocol::{CallEnvelope, CallFrame, ReplyEnvelope, ReplyFrame};

type Pending = Arc<DashMap<String, oneshot::Sender<ReplyEnvelope>>>;

/// First failed write to the worker's stdin.
type WriteError = Arc<Mutex<Option<(io::ErrorKind, String)>>>;

/// Name of the binary that hosts the worker.
const WORKER_BINARY: &str = "sealed-sql";

/// A worker running as a child process.
///
/// # Example
///
/// ```ignore
/// use sealed_sql::client::{Database, ProcessTransport};
///
/// let transport = ProcessTransport::spawn("sealed-sql", &["worker".into()]).await?;
/// let db = Database::new(std::sync::Arc::new(transport));
/// ```
#[derive(Debug)]
pub struct ProcessTransport {
    /// Frames waiting for the writer task.
    outgoing: Mutex<Option<mpsc::UnboundedSender<CallFrame>>>,

    /// Calls awaiting a reply, keyed by frame id.
    pending: Pending,

    alive: Arc<AtomicBool>,

    write_error: WriteError,

    child: Mutex<Option<Child>>,

    reader: JoinHandle<()>,

    writer: JoinHandle<()>,
}

impl ProcessTransport {
    /// Spawn `worker_path` with `args` and connect to its stdin/stdout.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn spawn<P: AsRef<Path>>(
        worker_path: P,
        args: &[String],
    ) -> Result<Self, TransportError> {
        let mut child = Command::new(worker_path.as_ref())
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(TransportError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| not_captured("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| not_captured("stdout"))?;

        let pending: Pending = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let write_error: WriteError = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = Self::spawn_reader_task(stdout, Arc::clone(&pending), Arc::clone(&alive));
        let writer = Self::spawn_writer_task(
            stdin,
            rx,
            Arc::clone(&pending),
            Arc::clone(&alive),
            Arc::clone(&write_error),
        );

        info!(path = %worker_path.as_ref().display(), pid = ?child.id(), "worker process started");
        Ok(Self {
            outgoing: Mutex::new(Some(tx)),
            pending,
            alive,
            write_error,
            child: Mutex::new(Some(child)),
            reader,
            writer,
        })
    }

    /// Spawn a worker as described by `settings`.
    ///
    /// Uses `worker.path` when set, otherwise a `sealed-sql` binary next to
    /// the current executable, otherwise `sealed-sql` from `PATH`.
    pub async fn spawn_with_settings(settings: &Settings) -> Result<Self, TransportError> {
        let worker_path = Self::resolve_worker_path(settings)?;
        let mut args = vec!["worker".to_string()];
        let storage_dir = settings.storage_dir().map_err(invalid_settings)?;
        if let Some(dir) = storage_dir {
            args.push("--storage-dir".to_string());
            args.push(dir.display().to_string());
        }
        Self::spawn(&worker_path, &args).await
    }

    fn resolve_worker_path(settings: &Settings) -> Result<PathBuf, TransportError> {
        if let Some(path) = settings.worker_path().map_err(invalid_settings)? {
            return Ok(path);
        }

        if let Ok(exe) = std::env::current_exe() {
            // Test binaries live one level below the package binaries.
            let candidates = exe
                .ancestors()
                .skip(1)
                .take(2)
                .map(|dir| dir.join(WORKER_BINARY).with_extension(std::env::consts::EXE_EXTENSION));
            for candidate in candidates {
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        Ok(PathBuf::from(WORKER_BINARY))
    }

    fn spawn_reader_task(stdout: ChildStdout, pending: Pending, alive: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ReplyFrame>(&line) {
                            Ok(frame) => match pending.remove(&frame.id) {
                                Some((_, tx)) => {
                                    let _ = tx.send(frame.reply);
                                }
                                None => debug!(id = %frame.id, "reply for unknown or abandoned call"),
                            },
                            Err(e) => warn!(error = %e, "failed to parse reply frame"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "worker read error");
                        break;
                    }
                }
            }

            // Dropping the senders fails every outstanding call.
            alive.store(false, Ordering::SeqCst);
            let orphaned = pending.len();
            pending.clear();
            info!(orphaned, "worker process exited");
        })
    }

    fn spawn_writer_task(
        stdin: ChildStdin,
        mut frames: mpsc::UnboundedReceiver<CallFrame>,
        pending: Pending,
        alive: Arc<AtomicBool>,
        write_error: WriteError,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stdin = BufWriter::new(stdin);
            while let Some(frame) = frames.recv().await {
                let line = match serde_json::to_string(&frame) {
                    Ok(line) => line + "\n",
                    Err(e) => {
                        warn!(id = %frame.id, error = %e, "failed to encode call frame");
                        continue;
                    }
                };
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                };
                if let Err(e) = written.await {
                    warn!(id = %frame.id, error = %e, "failed to write to worker");
                    if let Ok(mut slot) = write_error.lock() {
                        slot.get_or_insert((e.kind(), e.to_string()));
                    }
                    alive.store(false, Ordering::SeqCst);
                    // The error is recorded first so the woken caller sees it.
                    pending.remove(&frame.id);
                    break;
                }
            }
            debug!("worker writer finished");
        })
    }
}

fn not_captured(stream: &str) -> TransportError {
    TransportError::SpawnFailed(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("worker {} not captured", stream),
    ))
}

fn invalid_settings(e: crate::config::SettingsError) -> TransportError {
    TransportError::SpawnFailed(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
}

impl Transport for ProcessTransport {
    fn post(
        &self,
        call: CallEnvelope,
        reply_to: oneshot::Sender<ReplyEnvelope>,
    ) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(self.failure().unwrap_or(TransportError::WorkerExited));
        }

        // Callers that gave up (deadline, drop) leave closed senders behind.
        self.pending.retain(|_, tx| !tx.is_closed());

        let id = Uuid::new_v4().to_string();
        self.pending.insert(id.clone(), reply_to);

        let sent = self
            .outgoing
            .lock()
            .ok()
            .and_then(|outgoing| {
                outgoing
                    .as_ref()
                    .map(|tx| tx.send(CallFrame { id: id.clone(), call }).is_ok())
            })
            .unwrap_or(false);
        if !sent {
            self.pending.remove(&id);
            return Err(TransportError::WorkerExited);
        }
        Ok(())
    }

    fn terminate(&self) {
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }
        if let Ok(mut child) = self.child.lock() {
            if let Some(child) = child.as_mut() {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "worker already gone");
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        self.pending.clear();
        info!("worker process terminated");
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.reader.is_finished()
    }

    fn failure(&self) -> Option<TransportError> {
        let slot = self.write_error.lock().ok()?;
        let (kind, message) = slot.as_ref()?;
        Some(TransportError::WriteFailed(io::Error::new(*kind, message.clone())))
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = ProcessTransport::spawn("/nonexistent/sealed-sql-worker", &[]).await;
        assert!(matches!(result, Err(TransportError::SpawnFailed(_))));
    }

    #[test]
    fn test_configured_path_wins() {
        let settings: Settings = toml::from_str("[worker]\npath = \"/opt/bin/worker\"").unwrap();
        assert_eq!(
            ProcessTransport::resolve_worker_path(&settings).unwrap(),
            PathBuf::from("/opt/bin/worker")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exit_fails_pending_calls() {
        // `cat` echoes the call frame back, which is not a valid reply, then
        // exits when stdin closes.
        let transport = ProcessTransport::spawn("cat", &[]).await.unwrap();
        let (tx, rx) = oneshot::channel();
        transport.post(CallEnvelope::constructor(), tx).unwrap();
        transport.terminate();
        assert!(rx.await.is_err());
        assert!(!transport.is_alive());

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            transport.post(CallEnvelope::constructor(), tx),
            Err(TransportError::WorkerExited)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_closed_stdin_reports_write_failure() {
        let args = vec!["-c".to_string(), "exec 0<&-; sleep 5".to_string()];
        let transport = ProcessTransport::spawn("sh", &args).await.unwrap();
        // Give the child time to close its end of the pipe.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let (tx, rx) = oneshot::channel();
        transport.post(CallEnvelope::constructor(), tx).unwrap();
        let received = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap();
        assert!(received.is_err());
        assert!(!transport.is_alive());
        assert!(matches!(transport.failure(), Some(TransportError::WriteFailed(_))));

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            transport.post(CallEnvelope::constructor(), tx),
            Err(TransportError::WriteFailed(_))
        ));
    }
}
