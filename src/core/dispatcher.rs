//! Ticket dispatcher: the per-worker-loop controller.
//!
//! A [`WorkerLoop`] owns one worker [`Connection`], a [`TicketPool`] sized to the
//! concurrency ceiling, the in-flight blocking pops and a [`ProcessingPipeline`].
//! All of that state is plain data mutated from a single task; the loop advances
//! by handling exactly one of four event kinds at a time:
//!
//! - connection events (`Ready` refills, a final `Cutted` ends the loop),
//! - a finished fetch (job, empty pop, or error),
//! - a finished job from the pipeline,
//! - teardown (the loop future is dropped).
//!
//! Every ticket taken by a fetch is given back exactly once: when the fetch
//! yields nothing usable, or when the job it produced finishes processing.
//! An over-fetch ends the loop with [`QueueError::OverFetch`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::codec;
use super::connection::{Connection, ConnectionEvent, WorkLease};
use super::error::QueueError;
use super::error_bus::ErrorBus;
use super::pipeline::{JobOutcome, ProcessingPipeline};
use super::processor::{JobPayload, JobProcessor};
use super::shutdown::ShutdownCoordinator;
use super::tickets::TicketPool;
use crate::config::ClientOptions;
use crate::infra::broker::{Broker, BrokerError};
use crate::runtime::{Spawn, TokioSpawner};

type Fetched = Result<Option<(String, WorkLease)>, BrokerError>;

/// Sender side of a worker loop's outcome stream.
pub type OutcomeSender = mpsc::UnboundedSender<Result<JobOutcome, QueueError>>;

/// Point-in-time statistics of one worker loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Concurrency ceiling.
    pub ceiling: usize,
    /// Tickets currently available.
    pub tickets_available: usize,
    /// Highest number of tickets ever in use at once.
    pub peak_in_use: usize,
    /// Jobs currently being processed.
    pub processing: usize,
    /// Jobs whose processor succeeded.
    pub processed: u64,
    /// Jobs whose processor failed or panicked.
    pub failed: u64,
}

impl WorkerStats {
    /// Tickets currently consumed by fetches or processing.
    #[must_use]
    pub const fn tickets_in_use(&self) -> usize {
        self.ceiling - self.tickets_available
    }
}

/// Shared counters behind [`WorkerStats`], written by the loop and read anywhere.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    ceiling: AtomicUsize,
    available: AtomicUsize,
    peak_in_use: AtomicUsize,
    processing: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl WorkerCounters {
    fn with_ceiling(ceiling: usize) -> Self {
        let counters = Self::default();
        counters.ceiling.store(ceiling, Ordering::Relaxed);
        counters.available.store(ceiling, Ordering::Relaxed);
        counters
    }

    fn record_tickets(&self, tickets: &TicketPool) {
        self.available.store(tickets.available(), Ordering::Relaxed);
        self.peak_in_use.fetch_max(tickets.in_use(), Ordering::Relaxed);
    }

    /// Take a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            ceiling: self.ceiling.load(Ordering::Relaxed),
            tickets_available: self.available.load(Ordering::Relaxed),
            peak_in_use: self.peak_in_use.load(Ordering::Relaxed),
            processing: self.processing.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// One consumer loop bound to its own connection.
pub struct WorkerLoop<B: Broker, J, P> {
    connection: Arc<Connection<B>>,
    events: Option<broadcast::Receiver<ConnectionEvent>>,
    queue_key: Arc<str>,
    pop_timeout: Option<Duration>,
    /// Pause before refetching after a pop failed with a command error.
    command_backoff: Duration,
    tickets: TicketPool,
    fetches: FuturesUnordered<BoxFuture<'static, Fetched>>,
    pipeline: ProcessingPipeline<J, P>,
    errors: ErrorBus,
    shutdown: Arc<ShutdownCoordinator>,
    outcomes: Option<OutcomeSender>,
    counters: Arc<WorkerCounters>,
    spawner: TokioSpawner,
    fatal: Option<QueueError>,
    finished: bool,
}

impl<B, J, P> WorkerLoop<B, J, P>
where
    B: Broker,
    J: JobPayload,
    P: JobProcessor<J>,
{
    /// Bind a loop to `connection`.
    ///
    /// Subscribes to the connection's events immediately, so the connection may
    /// be started any time afterwards without the loop missing `Ready`.
    pub fn new(
        connection: Arc<Connection<B>>,
        options: &ClientOptions,
        processor: P,
        errors: ErrorBus,
        shutdown: Arc<ShutdownCoordinator>,
        spawner: TokioSpawner,
    ) -> Self {
        let events = connection.subscribe();
        Self {
            connection,
            events: Some(events),
            queue_key: Arc::from(options.queue_key.as_str()),
            pop_timeout: options.pop_timeout(),
            command_backoff: options.retry_policy().base_delay,
            tickets: TicketPool::new(options.concurrency),
            fetches: FuturesUnordered::new(),
            pipeline: ProcessingPipeline::new(processor, errors.clone()),
            errors,
            shutdown,
            outcomes: None,
            counters: Arc::new(WorkerCounters::with_ceiling(options.concurrency)),
            spawner,
            fatal: None,
            finished: false,
        }
    }

    /// Forward every job outcome (and the loop's final error) to `sender`.
    #[must_use]
    pub fn with_outcomes(mut self, sender: OutcomeSender) -> Self {
        self.outcomes = Some(sender);
        self
    }

    /// Live counters of this loop.
    #[must_use]
    pub fn counters(&self) -> Arc<WorkerCounters> {
        Arc::clone(&self.counters)
    }

    /// Start the connection and consume until it is closed.
    ///
    /// Resolves `Ok` when the connection closes because the client shut down.
    /// Dropping the returned future tears the loop down and closes the
    /// connection without draining.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionCutted`] when the connection is lost for
    /// good while the client is still running, or [`QueueError::OverFetch`] when
    /// the ticket accounting breaks.
    pub async fn run(mut self) -> Result<(), QueueError> {
        self.connection.start(&self.spawner);
        info!(
            connection = %self.connection.name(),
            queue = %self.queue_key,
            ceiling = self.tickets.ceiling(),
            "worker loop started"
        );
        let result = self.drive().await;
        self.finished = true;
        if let (Err(err), Some(outcomes)) = (&result, &self.outcomes) {
            let _ = outcomes.send(Err(terminal_copy(err)));
            debug!(error = %err, "worker loop error forwarded to outcome stream");
        }
        result
    }

    async fn drive(&mut self) -> Result<(), QueueError> {
        let Some(mut events) = self.events.take() else {
            return Ok(());
        };
        loop {
            if let Some(err) = self.fatal.take() {
                return self.on_fatal(err).await;
            }
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Ready) => self.refill(),
                    Ok(ConnectionEvent::Cutted { is_final: true }) | Err(RecvError::Closed) => {
                        return self.on_cut().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection = %self.connection.name(), skipped, "worker loop lagged behind connection events");
                        if self.connection.is_live() {
                            self.refill();
                        } else if self.connection.is_closed() {
                            return self.on_cut().await;
                        }
                    }
                },
                Some(fetched) = self.fetches.next(), if !self.fetches.is_empty() => {
                    self.on_fetched(fetched);
                }
                Some((outcome, lease)) = self.pipeline.next_done(), if !self.pipeline.is_empty() => {
                    self.on_done(outcome);
                    drop(lease);
                }
            }
        }
    }

    /// Issue one fetch per available ticket.
    fn refill(&mut self) {
        let available = self.tickets.available();
        debug!(connection = %self.connection.name(), available, "refilling fetches");
        for _ in 0..available {
            self.fetch();
        }
    }

    fn fetch(&mut self) {
        self.fetch_after(None);
    }

    /// Take a ticket and issue a pop, optionally after `delay`.
    fn fetch_after(&mut self, delay: Option<Duration>) {
        if !self.tickets.try_take() {
            let ceiling = self.tickets.ceiling();
            error!(
                connection = %self.connection.name(),
                ceiling,
                "over-fetching: ticket requested from an empty pool"
            );
            self.errors.emit(QueueError::OverFetch { ceiling });
            self.fatal.get_or_insert(QueueError::OverFetch { ceiling });
            return;
        }
        self.counters.record_tickets(&self.tickets);
        let connection = Arc::clone(&self.connection);
        let key = Arc::clone(&self.queue_key);
        let timeout = self.pop_timeout;
        self.fetches.push(
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                connection.pop(&key, timeout).await
            }
            .boxed(),
        );
    }

    fn on_fetched(&mut self, fetched: Fetched) {
        match fetched {
            Ok(Some((payload, lease))) => match codec::decode::<J>(&payload) {
                Ok(job) => {
                    self.counters.processing.fetch_add(1, Ordering::Relaxed);
                    self.pipeline.dispatch(job, lease);
                }
                Err(err) => {
                    self.errors.emit(err);
                    drop(lease);
                    self.release();
                }
            },
            Ok(None) => self.release(),
            Err(err) => {
                let backoff =
                    matches!(err, BrokerError::Command(_)).then_some(self.command_backoff);
                self.errors.emit(QueueError::Broker(err));
                self.release_after(backoff);
            }
        }
    }

    fn on_done(&mut self, outcome: JobOutcome) {
        self.counters.processing.fetch_sub(1, Ordering::Relaxed);
        let tally = if outcome.is_processed() {
            &self.counters.processed
        } else {
            &self.counters.failed
        };
        tally.fetch_add(1, Ordering::Relaxed);
        if let Some(outcomes) = &self.outcomes {
            let _ = outcomes.send(Ok(outcome));
        }
        self.release();
    }

    /// Return a ticket and, while the connection is live, fetch again.
    fn release(&mut self) {
        self.release_after(None);
    }

    fn release_after(&mut self, delay: Option<Duration>) {
        self.tickets.release();
        self.counters.record_tickets(&self.tickets);
        if self.connection.is_live() && self.fatal.is_none() {
            self.fetch_after(delay);
        }
    }

    /// Stop on a broken invariant: close without drain and settle the pops.
    async fn on_fatal(&mut self, err: QueueError) -> Result<(), QueueError> {
        error!(connection = %self.connection.name(), error = %err, "worker loop stopped by invariant violation");
        self.connection.close(false).await;
        while let Some(fetched) = self.fetches.next().await {
            self.on_fetched(fetched);
        }
        Err(err)
    }

    async fn on_cut(&mut self) -> Result<(), QueueError> {
        // Closed connections complete their pops promptly; settle the tickets.
        while let Some(fetched) = self.fetches.next().await {
            self.on_fetched(fetched);
        }
        if self.shutdown.is_shutdown() {
            while let Some((outcome, lease)) = self.pipeline.next_done().await {
                self.on_done(outcome);
                drop(lease);
            }
            info!(
                connection = %self.connection.name(),
                available = self.tickets.available(),
                "worker loop stopped by shutdown"
            );
            return Ok(());
        }
        let connection = self.connection.name().to_string();
        error!(%connection, in_flight = self.pipeline.in_flight(), "worker connection cut while processing");
        self.errors.emit(QueueError::ConnectionCutted {
            connection: connection.clone(),
        });
        Err(QueueError::ConnectionCutted { connection })
    }
}

/// Rebuild a terminal loop error for the outcome stream.
fn terminal_copy(err: &QueueError) -> QueueError {
    match err {
        QueueError::ConnectionCutted { connection } => QueueError::ConnectionCutted {
            connection: connection.clone(),
        },
        QueueError::OverFetch { ceiling } => QueueError::OverFetch { ceiling: *ceiling },
        other => QueueError::Runtime(other.to_string()),
    }
}

impl<B: Broker, J, P> Drop for WorkerLoop<B, J, P> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Stop listening before asking the connection to go away.
        drop(self.events.take());
        debug!(connection = %self.connection.name(), "worker loop torn down; closing connection without drain");
        let connection = Arc::clone(&self.connection);
        self.spawner.spawn(async move { connection.close(false).await });
    }
}
