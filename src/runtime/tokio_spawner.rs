//! Tokio runtime spawner implementation.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::Spawn;
use crate::core::QueueError;

/// Tokio-based spawner that executes tasks on a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioSpawner {
    handle: Arc<tokio::runtime::Handle>,
}

impl TokioSpawner {
    /// Create a new `TokioSpawner` from a tokio runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Capture the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Runtime`] when called outside a tokio runtime.
    pub fn try_current() -> Result<Self, QueueError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| QueueError::Runtime(e.to_string()))
    }

    /// Spawn a future and keep its join handle.
    pub fn spawn_with_handle<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// The underlying runtime handle.
    #[must_use]
    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}
