//! Runtime adapters for driving supervisors, monitors and worker loops.

pub mod tokio_spawner;

use std::future::Future;

pub use tokio_spawner::TokioSpawner;

/// Abstraction over spawning detached background futures.
pub trait Spawn {
    /// Spawn an async task that runs to completion on its own.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
