//! Core queue engine: connections, dispatch, processing and shutdown.

pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod error_bus;
pub mod pipeline;
pub mod processor;
pub mod shutdown;
pub mod tickets;

pub use client::{QueueClient, WorkerStream, CONTROL_CONNECTION, WORKER_CONNECTION_PREFIX};
pub use connection::{Connection, ConnectionEvent, ConnectionState, RetryPolicy, WorkLease};
pub use dispatcher::{WorkerCounters, WorkerLoop, WorkerStats};
pub use error::{AppResult, ErrorClass, QueueError};
pub use error_bus::ErrorBus;
pub use pipeline::{JobOutcome, ProcessingPipeline};
pub use processor::{processor_fn, FnProcessor, JobPayload, JobProcessor};
pub use shutdown::ShutdownCoordinator;
pub use tickets::TicketPool;
