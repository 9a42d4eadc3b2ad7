//! Broker backends: the list-based store jobs travel through.
//!
//! A [`Broker`] is a cloneable factory for [`BrokerSession`]s. Each session is one
//! transport connection supporting append-to-tail, blocking pop from the head and a
//! length query. Sessions never reconnect on their own; that is the job of
//! [`crate::core::Connection`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use memory::{InMemoryBroker, InMemorySession};
#[cfg(feature = "redis-backend")]
pub use self::redis::{RedisBroker, RedisSession};

/// Errors reported by broker sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The transport dropped; the session is unusable and should be replaced.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// A single command failed; the session itself is still usable.
    #[error("command failed: {0}")]
    Command(String),
    /// The session was used after it was closed.
    #[error("session closed")]
    Closed,
}

impl BrokerError {
    /// Whether this error means the underlying transport is gone.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

/// Factory for broker sessions.
#[async_trait]
pub trait Broker: Clone + Send + Sync + 'static {
    /// Session type produced by [`Broker::connect`].
    type Session: BrokerSession;

    /// Open a new session. `name` identifies the caller in logs and diagnostics.
    async fn connect(&self, name: &str) -> Result<Self::Session, BrokerError>;

    /// Human-readable broker address for logging.
    fn describe(&self) -> String;
}

/// One transport session against the broker.
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    /// Append every payload, in order, to the tail of `key`.
    async fn push(&self, key: &str, payloads: &[String]) -> Result<(), BrokerError>;

    /// Pop from the head of `key`, waiting until a payload arrives.
    ///
    /// `None` waits indefinitely. With `Some(timeout)` the pop may complete with
    /// `Ok(None)` when nothing arrived in time.
    async fn pop(&self, key: &str, timeout: Option<Duration>) -> Result<Option<String>, BrokerError>;

    /// Current number of payloads stored under `key`.
    async fn len(&self, key: &str) -> Result<u64, BrokerError>;

    /// Resolves once the transport is lost, yielding the cause.
    async fn disconnected(&self) -> BrokerError;

    /// Tear the transport down. Further commands fail with [`BrokerError::Closed`].
    async fn close(&self);
}
