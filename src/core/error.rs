//! Error types for queue client, connection and worker-loop operations.

use thiserror::Error;

use crate::infra::broker::BrokerError;

/// Broad classification of a [`QueueError`], used to decide how far it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Operation attempted after the client entered its shutdown state.
    Shutdown,
    /// Connection lifecycle problem (disconnect, loss, terminal cut).
    Connection,
    /// Failure scoped to a single job; recovered locally by the worker loop.
    PerJob,
    /// Dispatcher invariant violated. Always a bug, never transient.
    Invariant,
    /// Invalid options or missing runtime.
    Config,
    /// Broker command or transport failure.
    Backend,
}

/// Errors produced by the queue client and its worker loops.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Producer or consumer operation invoked after shutdown began.
    #[error("client is shut down")]
    Shutdown,
    /// A connection dropped unexpectedly and is trying to recover.
    #[error("connection `{connection}` is disconnecting: {cause}")]
    ConnectionDisconnecting {
        /// Name of the affected connection.
        connection: String,
        /// Transport error that ended the session.
        cause: BrokerError,
    },
    /// The control connection was lost for good while the client was running.
    #[error("control connection lost")]
    ControlConnectionLost,
    /// A worker connection was cut for good while its loop was active.
    #[error("connection `{connection}` was cut while processing")]
    ConnectionCutted {
        /// Name of the affected connection.
        connection: String,
    },
    /// A popped payload could not be decoded into a job.
    #[error("failed to deserialize job: {0}")]
    Deserialize(#[source] serde_json::Error),
    /// A job could not be encoded for transport.
    #[error("failed to serialize job: {0}")]
    Serialize(#[source] serde_json::Error),
    /// The user processor failed (or panicked) for one job.
    #[error("job processor failed: {0:#}")]
    Processor(anyhow::Error),
    /// A ticket was requested while the pool was empty.
    #[error("over-fetching: ticket requested with none of {ceiling} available")]
    OverFetch {
        /// Concurrency ceiling of the offending worker loop.
        ceiling: usize,
    },
    /// Broker command or transport failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// Options failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// No async runtime was available to drive background tasks.
    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

impl QueueError {
    /// Classify this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Shutdown => ErrorClass::Shutdown,
            Self::ConnectionDisconnecting { .. }
            | Self::ControlConnectionLost
            | Self::ConnectionCutted { .. } => ErrorClass::Connection,
            Self::Deserialize(_) | Self::Serialize(_) | Self::Processor(_) => ErrorClass::PerJob,
            Self::OverFetch { .. } => ErrorClass::Invariant,
            Self::InvalidConfig(_) | Self::Runtime(_) => ErrorClass::Config,
            Self::Broker(_) => ErrorClass::Backend,
        }
    }

    /// Whether this error is a dispatcher invariant violation.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self.class(), ErrorClass::Invariant)
    }

    /// Whether this error is the shutdown-state error.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
