//! Job payload marker and the user-supplied processor abstraction.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Marker trait for job payloads carried through the broker.
///
/// Jobs cross the broker as JSON, so they must round-trip through serde, and
/// they move into processing tasks, so they must be `Send`.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Blanket implementation: any type meeting the requirements is a `JobPayload`.
impl<T> JobPayload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Business logic run once per consumed job.
///
/// Each job is processed on its own task. Returning an error (or panicking)
/// marks that job as failed; the worker loop reports it and carries on.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use stanchion::core::JobProcessor;
///
/// #[derive(serde::Serialize, serde::Deserialize)]
/// struct Thumbnail { path: String }
///
/// #[derive(Clone)]
/// struct Resizer;
///
/// #[async_trait]
/// impl JobProcessor<Thumbnail> for Resizer {
///     async fn process(&self, job: Thumbnail) -> anyhow::Result<()> {
///         resize(&job.path).await
///     }
/// }
/// ```
#[async_trait]
pub trait JobProcessor<J: JobPayload>: Send + Sync + Clone + 'static {
    /// Process one decoded job.
    async fn process(&self, job: J) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`JobProcessor`].
#[derive(Clone)]
pub struct FnProcessor<F> {
    f: F,
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor").finish_non_exhaustive()
    }
}

/// Wrap `f` so it can be handed to a worker loop.
pub const fn processor_fn<F>(f: F) -> FnProcessor<F> {
    FnProcessor { f }
}

#[async_trait]
impl<J, F, Fut> JobProcessor<J> for FnProcessor<F>
where
    J: JobPayload,
    F: Fn(J) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, job: J) -> anyhow::Result<()> {
        (self.f)(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_processor_forwards_result() {
        let processor = processor_fn(|n: u32| async move {
            anyhow::ensure!(n % 2 == 0, "odd job {n}");
            Ok(())
        });
        assert!(processor.process(4).await.is_ok());
        let err = processor.process(3).await.unwrap_err();
        assert_eq!(err.to_string(), "odd job 3");
    }
}
