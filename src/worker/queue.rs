//! Single-flight FIFO admission for worker calls.

use std::collections::VecDeque;

/// Decides which call runs next. At most one call is in flight; the rest wait
/// in arrival order. Nothing runs before [`SerialQueue::mark_ready`].
///
/// The queue never runs anything itself: `submit`, `complete` and
/// `mark_ready` hand back the call that should start now, if any.
#[derive(Debug)]
pub struct SerialQueue<T> {
    pending: VecDeque<T>,
    processing: bool,
    ready: bool,
}

impl<T> Default for SerialQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SerialQueue<T> {
    /// A queue that holds calls until the runtime is ready.
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            processing: false,
            ready: false,
        }
    }

    /// A queue whose runtime is already ready.
    pub fn ready() -> Self {
        Self {
            ready: true,
            ..Self::new()
        }
    }

    /// Admit a call. Returns it back when it should start immediately.
    #[must_use]
    pub fn submit(&mut self, item: T) -> Option<T> {
        self.pending.push_back(item);
        self.start_next()
    }

    /// Record that the in-flight call finished. Returns the next call to start.
    #[must_use]
    pub fn complete(&mut self) -> Option<T> {
        self.processing = false;
        self.start_next()
    }

    /// Fire the one-time ready signal. Returns the oldest held call, if any.
    #[must_use]
    pub fn mark_ready(&mut self) -> Option<T> {
        self.ready = true;
        self.start_next()
    }

    fn start_next(&mut self) -> Option<T> {
        if self.processing || !self.ready {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.processing = true;
        Some(next)
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Calls waiting behind the in-flight one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Nothing in flight and nothing waiting.
    pub fn is_idle(&self) -> bool {
        !self.processing && self.pending.is_empty()
    }
}
