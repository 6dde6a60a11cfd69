//! The channel between a caller proxy and its worker.

use tokio::sync::oneshot;

use super::error::TransportError;
use crate::worker::protocol::{CallEnvelope, ReplyEnvelope};

/// Delivers calls to a worker.
///
/// `post` must not block: it hands the call to the worker (or queues it for
/// writing) and returns. The worker answers on `reply_to` exactly once, or
/// drops it if it goes away. Calls posted from one task reach the worker in
/// posting order.
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn post(
        &self,
        call: CallEnvelope,
        reply_to: oneshot::Sender<ReplyEnvelope>,
    ) -> Result<(), TransportError>;

    /// Stop the worker. Outstanding calls fail.
    fn terminate(&self);

    fn is_alive(&self) -> bool;

    /// Why the worker stopped accepting calls, when the transport knows.
    fn failure(&self) -> Option<TransportError> {
        None
    }
}
