//! Processing pipeline: runs the user processor once per dispatched job.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use super::connection::WorkLease;
use super::error::QueueError;
use super::error_bus::ErrorBus;
use super::processor::{JobPayload, JobProcessor};

/// Result of processing one job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The processor returned `Ok`.
    Processed,
    /// The processor failed or panicked. The same error went to the error bus.
    Failed(Arc<QueueError>),
}

impl JobOutcome {
    /// Whether the job was processed successfully.
    #[must_use]
    pub const fn is_processed(&self) -> bool {
        matches!(self, Self::Processed)
    }
}

type Finished = (Result<(), QueueError>, WorkLease);

/// Unbounded set of in-flight processor tasks for one worker loop.
///
/// Admission is bounded by the dispatcher's ticket pool only. Dropping the
/// pipeline aborts every task still running.
pub struct ProcessingPipeline<J, P> {
    processor: P,
    tasks: JoinSet<Finished>,
    errors: ErrorBus,
    _job: PhantomData<fn(J)>,
}

impl<J, P> ProcessingPipeline<J, P>
where
    J: JobPayload,
    P: JobProcessor<J>,
{
    /// Create an empty pipeline.
    pub fn new(processor: P, errors: ErrorBus) -> Self {
        Self {
            processor,
            tasks: JoinSet::new(),
            errors,
            _job: PhantomData,
        }
    }

    /// Start processing `job`. The lease is handed back by [`Self::next_done`].
    pub fn dispatch(&mut self, job: J, lease: WorkLease) {
        let processor = self.processor.clone();
        self.tasks.spawn(async move {
            let result = match AssertUnwindSafe(processor.process(job)).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(QueueError::Processor(err)),
                Err(panic) => Err(QueueError::Processor(anyhow::anyhow!(
                    "processor panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            (result, lease)
        });
        trace!(in_flight = self.tasks.len(), "job dispatched");
    }

    /// Wait for the next job to finish.
    ///
    /// Returns `None` when nothing is in flight. Failures are reported to the
    /// error bus before being returned. The lease is `None` only if the task was
    /// aborted.
    pub async fn next_done(&mut self) -> Option<(JobOutcome, Option<WorkLease>)> {
        let joined = self.tasks.join_next().await?;
        Some(match joined {
            Ok((Ok(()), lease)) => (JobOutcome::Processed, Some(lease)),
            Ok((Err(err), lease)) => (self.fail(err), Some(lease)),
            Err(join_err) => {
                debug!(error = %join_err, "processing task ended abnormally");
                let err = QueueError::Processor(anyhow::anyhow!("processing task aborted: {join_err}"));
                (self.fail(err), None)
            }
        })
    }

    /// Jobs currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no job is being processed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn fail(&self, err: QueueError) -> JobOutcome {
        let err = Arc::new(err);
        self.errors.emit_shared(Arc::clone(&err));
        JobOutcome::Failed(err)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
