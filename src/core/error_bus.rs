//! Fan-out of client-level errors to registered observers.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::error::QueueError;

const SUBSCRIBER_CAPACITY: usize = 128;

type Handler = Arc<dyn Fn(&QueueError) + Send + Sync>;

#[derive(Default)]
struct BusState {
    handlers: Vec<Handler>,
    subscribers: Option<broadcast::Sender<Arc<QueueError>>>,
    closed: bool,
}

/// Shared error channel of one client.
///
/// Errors are delivered to synchronous handlers (in registration order) and to
/// async subscribers. An error emitted with no observer attached is only logged.
/// After [`ErrorBus::close`] every emit is dropped.
#[derive(Clone, Default)]
pub struct ErrorBus {
    state: Arc<Mutex<BusState>>,
}

impl ErrorBus {
    /// Create an open bus with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler. Ignored once the bus is closed.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&QueueError) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.handlers.push(Arc::new(handler));
    }

    /// Subscribe to emitted errors. The receiver ends once the bus is closed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<QueueError>> {
        let mut state = self.state.lock();
        if state.closed {
            // Sender dropped right away: the receiver reports Closed.
            let (_, rx) = broadcast::channel(1);
            return rx;
        }
        state
            .subscribers
            .get_or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .subscribe()
    }

    /// Deliver `err` to every observer.
    pub fn emit(&self, err: QueueError) {
        self.emit_shared(Arc::new(err));
    }

    /// Deliver an already shared error to every observer.
    pub fn emit_shared(&self, err: Arc<QueueError>) {
        let (handlers, subscribers) = {
            let state = self.state.lock();
            if state.closed {
                debug!(error = %err, "error emitted after close; dropped");
                return;
            }
            (state.handlers.clone(), state.subscribers.clone())
        };
        warn!(error = %err, class = ?err.class(), "queue error");
        // Handlers run outside the lock so they may register further handlers.
        for handler in &handlers {
            handler(err.as_ref());
        }
        if let Some(subscribers) = subscribers {
            let _ = subscribers.send(err);
        }
    }

    /// Drop all observers and ignore future emits.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.handlers.clear();
        state.subscribers = None;
    }

    /// Whether [`Self::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
