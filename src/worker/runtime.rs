//! The worker's event loop and the in-process worker thread.
//!
//! ```text
//!   callers ──post──▶ mpsc inbox ──▶ SerialQueue ──▶ [one in-flight dispatch]
//!      ▲                                                      │
//!      └──────────────── oneshot reply per call ◀─────────────┘
//! ```
//!
//! The dispatcher is moved into the in-flight future and handed back when the
//! call finishes, so two dispatches can never overlap.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use futures::future::{FutureExt, LocalBoxFuture, OptionFuture};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::dispatcher::SequentialDispatcher;
use super::protocol::{CallEnvelope, ErrorDescriptor, ReplyEnvelope};
use super::queue::SerialQueue;
use crate::client::{Transport, TransportError};
use crate::core::CoreError;
use crate::engine;
use crate::storage::Storage;

/// A call waiting for the dispatcher, with the channel its reply goes to.
#[derive(Debug)]
pub struct QueuedCall {
    pub call: CallEnvelope,
    pub reply_to: oneshot::Sender<ReplyEnvelope>,
}

type Finished = (SequentialDispatcher, QueuedReply);
type InFlight = LocalBoxFuture<'static, Finished>;

struct QueuedReply {
    reply_to: oneshot::Sender<ReplyEnvelope>,
    reply: ReplyEnvelope,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "dispatch panicked".to_string()
    }
}

fn start(mut dispatcher: SequentialDispatcher, queued: QueuedCall) -> InFlight {
    async move {
        let QueuedCall { call, reply_to } = queued;
        let operation = call.operation.clone();
        let reply = match AssertUnwindSafe(dispatcher.dispatch(call))
            .catch_unwind()
            .await
        {
            Ok(reply) => reply,
            Err(payload) => {
                let err = CoreError::Internal(panic_message(payload.as_ref()));
                error!(operation = %operation, error = %err, "dispatch panicked");
                ReplyEnvelope::err(ErrorDescriptor::from_core(&err, &operation))
            }
        };
        (dispatcher, QueuedReply { reply_to, reply })
    }
    .boxed_local()
}

/// Run the worker loop until the inbox closes and every admitted call has
/// been answered, or until `kill` fires.
///
/// Calls are held until `ready` completes, then dispatched one at a time in
/// arrival order.
pub async fn serve<R>(
    mut inbox: mpsc::UnboundedReceiver<QueuedCall>,
    dispatcher: SequentialDispatcher,
    ready: R,
    kill: oneshot::Receiver<()>,
) where
    R: Future<Output = ()>,
{
    let mut queue: SerialQueue<QueuedCall> = SerialQueue::new();
    let mut idle = Some(dispatcher);
    let mut in_flight: Option<InFlight> = None;
    let mut ready: Pin<Box<R>> = Box::pin(ready);
    let mut kill = kill;
    let mut kill_armed = true;
    let mut inbox_open = true;

    loop {
        if !inbox_open && queue.is_idle() {
            break;
        }

        tokio::select! {
            killed = &mut kill, if kill_armed => match killed {
                Ok(()) => {
                    info!(queued = queue.len(), "worker terminated");
                    return;
                }
                // The kill switch was dropped without firing.
                Err(_) => kill_armed = false,
            },
            _ = ready.as_mut(), if !queue.is_ready() => {
                debug!(queued = queue.len(), "worker runtime ready");
                if let Some(next) = queue.mark_ready() {
                    in_flight = launch(&mut idle, next);
                }
            }
            Some((dispatcher, done)) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
                if done.reply_to.send(done.reply).is_err() {
                    debug!("caller dropped its reply channel");
                }
                idle = Some(dispatcher);
                if let Some(next) = queue.complete() {
                    in_flight = launch(&mut idle, next);
                }
            }
            message = inbox.recv(), if inbox_open => match message {
                Some(call) => {
                    if let Some(next) = queue.submit(call) {
                        in_flight = launch(&mut idle, next);
                    }
                }
                None => {
                    debug!("worker inbox closed");
                    inbox_open = false;
                }
            },
            else => break,
        }
    }
    info!("worker stopped");
}

fn launch(idle: &mut Option<SequentialDispatcher>, next: QueuedCall) -> Option<InFlight> {
    match idle.take() {
        Some(dispatcher) => Some(start(dispatcher, next)),
        None => {
            // The queue admitted a call while another was in flight.
            error!(operation = %next.call.operation, "dispatcher busy, dropping call");
            None
        }
    }
}

/// A worker running on its own thread, reachable through [`Transport`].
#[derive(Debug)]
pub struct WorkerHandle {
    inbox: Mutex<Option<mpsc::UnboundedSender<QueuedCall>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl WorkerHandle {
    /// Start a worker thread serving a fresh dispatcher over `storage`.
    pub fn spawn(storage: Arc<dyn Storage>) -> Result<Self, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let guard = AliveGuard(Arc::clone(&alive));

        let thread = thread::Builder::new()
            .name("sealed-sql-worker".to_string())
            .spawn(move || {
                let _guard = guard;
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "failed to start worker runtime");
                        return;
                    }
                };
                let ready = async {
                    if let Err(e) = engine::initialize() {
                        error!(error = %e, "engine failed to initialize");
                    }
                };
                runtime.block_on(serve(rx, SequentialDispatcher::new(storage), ready, kill_rx));
            })
            .map_err(TransportError::SpawnFailed)?;

        info!("worker thread started");
        Ok(Self {
            inbox: Mutex::new(Some(tx)),
            kill: Mutex::new(Some(kill_tx)),
            thread: Mutex::new(Some(thread)),
            alive,
        })
    }

    /// Stop accepting calls and wait for queued ones to be answered.
    pub fn shutdown(&self) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.take();
        }
        self.join();
    }

    fn join(&self) {
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Transport for WorkerHandle {
    fn post(
        &self,
        call: CallEnvelope,
        reply_to: oneshot::Sender<ReplyEnvelope>,
    ) -> Result<(), TransportError> {
        let inbox = self.inbox.lock().map_err(|_| TransportError::WorkerExited)?;
        let sender = inbox.as_ref().ok_or(TransportError::WorkerExited)?;
        sender
            .send(QueuedCall { call, reply_to })
            .map_err(|_| TransportError::WorkerExited)
    }

    fn terminate(&self) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.take();
        }
        let kill = self.kill.lock().ok().and_then(|mut k| k.take());
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        self.join();
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskStorage;

    fn queued(call: CallEnvelope) -> (QueuedCall, oneshot::Receiver<ReplyEnvelope>) {
        let (tx, rx) = oneshot::channel();
        (QueuedCall { call, reply_to: tx }, rx)
    }

    #[tokio::test]
    async fn test_calls_are_held_until_ready() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let (_kill_tx, kill_rx) = oneshot::channel();
        let dispatcher = SequentialDispatcher::new(Arc::new(DiskStorage::new()));

        let (first, first_rx) = queued(CallEnvelope::constructor());
        let (second, second_rx) = queued(CallEnvelope::new("isOpen", vec![]));
        tx.send(first).unwrap();
        tx.send(second).unwrap();
        drop(tx);

        let ready = async move {
            let _ = ready_rx.await;
        };
        let driver = async move {
            tokio::task::yield_now().await;
            ready_tx.send(()).unwrap();
        };
        tokio::join!(serve(rx, dispatcher, ready, kill_rx), driver);

        assert!(first_rx.await.unwrap().is_ok());
        assert_eq!(second_rx.await.unwrap().output, serde_json::json!(false));
    }

    #[test]
    fn test_worker_thread_answers_and_shuts_down() {
        let handle = WorkerHandle::spawn(Arc::new(DiskStorage::new())).unwrap();
        let (call, rx) = queued(CallEnvelope::constructor());
        handle.post(call.call, call.reply_to).unwrap();
        let reply = rx.blocking_recv().unwrap();
        assert!(reply.is_ok());

        handle.terminate();
        assert!(!handle.is_alive());
        let (call, _rx) = queued(CallEnvelope::constructor());
        assert!(matches!(
            handle.post(call.call, call.reply_to),
            Err(TransportError::WorkerExited)
        ));
    }
}
