//! Queue client: producer operations, worker loops and shutdown.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec;
use super::connection::{Connection, ConnectionEvent};
use super::dispatcher::{WorkerCounters, WorkerLoop, WorkerStats};
use super::error::QueueError;
use super::error_bus::ErrorBus;
use super::pipeline::JobOutcome;
use super::processor::{JobPayload, JobProcessor};
use super::shutdown::ShutdownCoordinator;
use crate::config::ClientOptions;
use crate::infra::broker::{Broker, BrokerError};
use crate::runtime::{Spawn, TokioSpawner};

/// Name of the producer-side connection.
pub const CONTROL_CONNECTION: &str = "stanchion:control";

/// Prefix of worker connection names; a sequence number follows.
pub const WORKER_CONNECTION_PREFIX: &str = "stanchion:worker:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Control,
    Worker,
}

struct ConnectionRegistry<B: Broker> {
    control: Option<Arc<Connection<B>>>,
    workers: Vec<Arc<Connection<B>>>,
    next_worker: u64,
}

struct ClientInner<B: Broker> {
    options: ClientOptions,
    broker: B,
    spawner: TokioSpawner,
    errors: ErrorBus,
    shutdown: Arc<ShutdownCoordinator>,
    registry: Mutex<ConnectionRegistry<B>>,
}

/// Handle to a job queue on a list broker.
///
/// Cloning is cheap; clones share connections, the error bus and the shutdown
/// state.
///
/// ```rust,ignore
/// use stanchion::config::ClientOptions;
/// use stanchion::core::{processor_fn, QueueClient};
/// use stanchion::infra::broker::InMemoryBroker;
///
/// let client = QueueClient::new(ClientOptions::default(), InMemoryBroker::new())?;
/// client.push(&[1u32, 2, 3]).await?;
///
/// let worker = client.clone();
/// tokio::spawn(async move {
///     worker.process(processor_fn(|n: u32| async move {
///         println!("job {n}");
///         Ok(())
///     })).await
/// });
///
/// client.shutdown().await?;
/// ```
pub struct QueueClient<B: Broker> {
    inner: Arc<ClientInner<B>>,
}

impl<B: Broker> Clone for QueueClient<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Broker> QueueClient<B> {
    /// Create a client. No connection is opened until first use.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] for invalid options and
    /// [`QueueError::Runtime`] when called outside a tokio runtime.
    pub fn new(options: ClientOptions, broker: B) -> Result<Self, QueueError> {
        options.validate().map_err(QueueError::InvalidConfig)?;
        let spawner = TokioSpawner::try_current()?;
        info!(
            broker = %broker.describe(),
            queue = %options.queue_key,
            concurrency = options.concurrency,
            "queue client created"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                broker,
                spawner,
                errors: ErrorBus::new(),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                registry: Mutex::new(ConnectionRegistry {
                    control: None,
                    workers: Vec::new(),
                    next_worker: 0,
                }),
            }),
        })
    }

    /// Options the client was built with.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_shutdown()
    }

    /// Register a handler for every error the client reports.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&QueueError) + Send + Sync + 'static,
    {
        self.inner.errors.on_error(handler);
    }

    /// Subscribe to every error the client reports.
    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<QueueError>> {
        self.inner.errors.subscribe()
    }

    /// Run `listener` once when shutdown begins (immediately if it already has).
    pub fn on_shutdown<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.shutdown.on_shutdown(listener);
    }

    /// Watch the shutdown flag.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Append `jobs`, in order, to the tail of the queue.
    ///
    /// # Errors
    ///
    /// [`QueueError::Shutdown`] after shutdown began (without touching the
    /// network), [`QueueError::Serialize`] if any job fails to encode (nothing
    /// is pushed), or the broker error of the push command.
    pub async fn push<J: JobPayload>(&self, jobs: &[J]) -> Result<(), QueueError> {
        if self.is_shutdown() {
            return Err(QueueError::Shutdown);
        }
        let payloads = jobs.iter().map(codec::encode).collect::<Result<Vec<_>, _>>()?;
        if payloads.is_empty() {
            return Ok(());
        }
        let control = self.control()?;
        control
            .push(&self.inner.options.queue_key, &payloads)
            .await
            .map_err(|err| self.command_error(err))?;
        debug!(queue = %self.inner.options.queue_key, count = payloads.len(), "jobs pushed");
        Ok(())
    }

    /// Append a single job.
    ///
    /// # Errors
    ///
    /// Same as [`Self::push`].
    pub async fn push_one<J: JobPayload>(&self, job: J) -> Result<(), QueueError> {
        self.push(std::slice::from_ref(&job)).await
    }

    /// Number of jobs waiting in the queue.
    ///
    /// # Errors
    ///
    /// [`QueueError::Shutdown`] after shutdown began, or the broker error.
    pub async fn size(&self) -> Result<u64, QueueError> {
        let control = self.control()?;
        control
            .len(&self.inner.options.queue_key)
            .await
            .map_err(|err| self.command_error(err))
    }

    /// Consume jobs on a dedicated connection until the client shuts down.
    ///
    /// Resolves `Ok` after shutdown drained this loop. Dropping the future
    /// tears the loop down and closes its connection without draining.
    ///
    /// # Errors
    ///
    /// [`QueueError::Shutdown`] if called after shutdown began, or
    /// [`QueueError::ConnectionCutted`] if the worker connection is lost for good,
    /// or [`QueueError::OverFetch`] if the loop's ticket accounting breaks.
    pub async fn process<J, P>(&self, processor: P) -> Result<(), QueueError>
    where
        J: JobPayload,
        P: JobProcessor<J>,
    {
        self.worker(processor)?.run().await
    }

    /// Like [`Self::process`], but runs the loop on its own task and yields each
    /// job's outcome. The stream ends after shutdown; a terminal connection
    /// or invariant error arrives as its last item. Dropping the stream tears the
    /// loop down.
    ///
    /// # Errors
    ///
    /// [`QueueError::Shutdown`] if called after shutdown began.
    pub fn process_stream<J, P>(&self, processor: P) -> Result<WorkerStream, QueueError>
    where
        J: JobPayload,
        P: JobProcessor<J>,
    {
        let (sender, outcomes) = mpsc::unbounded_channel();
        let worker = self.worker(processor)?.with_outcomes(sender);
        let counters = worker.counters();
        let task = self.inner.spawner.spawn_with_handle(async move {
            if let Err(err) = worker.run().await {
                debug!(error = %err, "worker task ended with error");
            }
        });
        Ok(WorkerStream {
            outcomes,
            task,
            counters,
        })
    }

    /// Stop accepting work, drain every connection and wait until all are closed.
    ///
    /// Jobs already being processed finish first. Must not be awaited from
    /// inside a job processor, since that job holds its connection open.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Shutdown`] if shutdown had already begun.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.inner.shutdown.begin()?;
        let connections: Vec<Arc<Connection<B>>> = {
            let registry = self.inner.registry.lock();
            registry
                .control
                .iter()
                .chain(registry.workers.iter())
                .cloned()
                .collect()
        };
        info!(connections = connections.len(), "shutting down");
        futures::future::join_all(connections.iter().map(|c| c.close(true))).await;
        self.inner.errors.close();
        info!("shutdown complete");
        Ok(())
    }

    fn command_error(&self, err: BrokerError) -> QueueError {
        if err == BrokerError::Closed && self.is_shutdown() {
            QueueError::Shutdown
        } else {
            QueueError::Broker(err)
        }
    }

    /// The control connection, created on first use.
    fn control(&self) -> Result<Arc<Connection<B>>, QueueError> {
        let mut registry = self.inner.registry.lock();
        // Checked under the lock so shutdown never misses a new connection.
        if self.is_shutdown() {
            return Err(QueueError::Shutdown);
        }
        if let Some(control) = &registry.control {
            return Ok(Arc::clone(control));
        }
        let control = Connection::new(
            CONTROL_CONNECTION,
            self.inner.broker.clone(),
            self.inner.options.retry_policy(),
        );
        self.monitor(&control, Role::Control);
        control.start(&self.inner.spawner);
        registry.control = Some(Arc::clone(&control));
        Ok(control)
    }

    fn worker<J, P>(&self, processor: P) -> Result<WorkerLoop<B, J, P>, QueueError>
    where
        J: JobPayload,
        P: JobProcessor<J>,
    {
        let mut registry = self.inner.registry.lock();
        if self.is_shutdown() {
            return Err(QueueError::Shutdown);
        }
        registry.workers.retain(|c| !c.is_closed());
        registry.next_worker += 1;
        let connection = Connection::new(
            format!("{WORKER_CONNECTION_PREFIX}{}", registry.next_worker),
            self.inner.broker.clone(),
            self.inner.options.retry_policy(),
        );
        self.monitor(&connection, Role::Worker);
        let worker = WorkerLoop::new(
            Arc::clone(&connection),
            &self.inner.options,
            processor,
            self.inner.errors.clone(),
            Arc::clone(&self.inner.shutdown),
            self.inner.spawner.clone(),
        );
        registry.workers.push(connection);
        Ok(worker)
    }

    /// Forward a connection's lifecycle events onto the error bus.
    fn monitor(&self, connection: &Arc<Connection<B>>, role: Role) {
        let mut events = connection.subscribe();
        let name = connection.name().to_string();
        let errors = self.inner.errors.clone();
        let shutdown = Arc::clone(&self.inner.shutdown);
        let client = Arc::downgrade(&self.inner);
        self.inner.spawner.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Error(err)) => errors.emit(QueueError::Broker(err)),
                    Ok(ConnectionEvent::Disconnecting(cause)) => {
                        if !shutdown.is_shutdown() {
                            errors.emit(QueueError::ConnectionDisconnecting {
                                connection: name.clone(),
                                cause,
                            });
                        }
                    }
                    Ok(ConnectionEvent::Cutted { is_final: true }) => {
                        if role == Role::Control && !shutdown.is_shutdown() {
                            escalate_control_loss(client).await;
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection = %name, skipped, "connection monitor lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(connection = %name, "connection monitor finished");
        });
    }
}

/// Report the loss of the control connection and shut the client down.
async fn escalate_control_loss<B: Broker>(client: Weak<ClientInner<B>>) {
    let Some(inner) = client.upgrade() else {
        return;
    };
    error!("control connection lost; shutting the client down");
    inner.errors.emit(QueueError::ControlConnectionLost);
    let client = QueueClient { inner };
    if let Err(err) = client.shutdown().await {
        debug!(error = %err, "automatic shutdown failed; suppressed");
    }
}

/// Outcomes of a worker loop running on its own task.
///
/// Yields one item per finished job. If the loop fails (worker connection
/// lost for good, or an over-fetch), the last item is that error. Dropping the stream stops the loop and
/// closes its connection without draining.
#[derive(Debug)]
pub struct WorkerStream {
    outcomes: mpsc::UnboundedReceiver<Result<JobOutcome, QueueError>>,
    task: JoinHandle<()>,
    counters: Arc<WorkerCounters>,
}

impl WorkerStream {
    /// Current statistics of the underlying worker loop.
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Whether the worker loop has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Stream for WorkerStream {
    type Item = Result<JobOutcome, QueueError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.outcomes.poll_recv(cx)
    }
}

impl Drop for WorkerStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
