//! One-shot shutdown flag with listeners.

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::error::QueueError;

type Listener = Box<dyn FnOnce() + Send>;

/// Tracks whether a client is shutting down and notifies listeners once.
pub struct ShutdownCoordinator {
    flag: watch::Sender<bool>,
    listeners: Mutex<Vec<Listener>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: watch::channel(false).0,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.flag.borrow()
    }

    /// Register a listener run once when shutdown begins.
    ///
    /// A listener registered after shutdown began runs immediately.
    pub fn on_shutdown<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut listeners = self.listeners.lock();
            if !self.is_shutdown() {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }

    /// Watch the shutdown flag. The value turns `true` exactly once.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }

    /// Flip into the shutdown state and run every listener.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Shutdown`] if shutdown had already begun.
    pub fn begin(&self) -> Result<(), QueueError> {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if !self.flag.send_if_modified(|flag| !std::mem::replace(flag, true)) {
                return Err(QueueError::Shutdown);
            }
            std::mem::take(&mut *listeners)
        };
        debug!(listeners = listeners.len(), "shutdown started");
        for listener in listeners {
            listener();
        }
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
