//! Infrastructure adapters for broker backends.

pub mod broker;

pub use broker::{Broker, BrokerError, BrokerSession, InMemoryBroker};
#[cfg(feature = "redis-backend")]
pub use broker::RedisBroker;
