//! Redis broker: `RPUSH` / `BLPOP` / `LLEN` over multiplexed async connections.
//!
//! Each session holds two multiplexed connections. Commands run on the first; the
//! second only `PING`s at a fixed interval so that loss of an idle session is
//! noticed even while a `BLPOP` is parked on the command connection.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::RedisError;

use super::{Broker, BrokerError, BrokerSession};

/// Map a redis error onto the broker taxonomy.
fn classify(err: &RedisError) -> BrokerError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        BrokerError::ConnectionLost(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}

/// Redis-backed broker.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    health_interval: Duration,
}

impl RedisBroker {
    /// Create a broker for `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Command`] if the URL cannot be parsed.
    pub fn open(url: &str, health_interval: Duration) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(Self {
            client,
            health_interval,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    type Session = RedisSession;

    async fn connect(&self, name: &str) -> Result<Self::Session, BrokerError> {
        let commands = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| classify(&e))?;
        let health = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| classify(&e))?;
        tracing::debug!(name, address = %self.describe(), "redis session opened");
        Ok(RedisSession {
            commands: Mutex::new(Some(commands)),
            health: Mutex::new(health),
            health_interval: self.health_interval,
        })
    }

    fn describe(&self) -> String {
        self.client.get_connection_info().addr.to_string()
    }
}

/// Session against a [`RedisBroker`].
pub struct RedisSession {
    /// `None` once closed; dropping the last clone closes the socket.
    commands: Mutex<Option<MultiplexedConnection>>,
    health: Mutex<MultiplexedConnection>,
    health_interval: Duration,
}

impl RedisSession {
    fn commands(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.commands.lock().clone().ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl BrokerSession for RedisSession {
    async fn push(&self, key: &str, payloads: &[String]) -> Result<(), BrokerError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut conn = self.commands()?;
        // A single variadic RPUSH appends all payloads atomically and in order.
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key);
        for payload in payloads {
            cmd.arg(payload);
        }
        let _len: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(&e))?;
        Ok(())
    }

    async fn pop(&self, key: &str, timeout: Option<Duration>) -> Result<Option<String>, BrokerError> {
        let mut conn = self.commands()?;
        // BLPOP treats 0 as "block forever".
        let timeout_secs = timeout.map_or(0.0, |t| t.as_secs_f64().max(0.01));
        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(&e))?;
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn len(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.commands()?;
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(&e))
    }

    async fn disconnected(&self) -> BrokerError {
        let mut health = self.health.lock().clone();
        loop {
            tokio::time::sleep(self.health_interval).await;
            let pong: Result<String, RedisError> = redis::cmd("PING").query_async(&mut health).await;
            if let Err(e) = pong {
                let err = classify(&e);
                if err.is_connection_lost() {
                    return err;
                }
                tracing::debug!(error = %e, "redis health check failed without losing the connection");
            }
        }
    }

    async fn close(&self) {
        // No QUIT: it would queue behind a parked BLPOP on the multiplexed pipeline.
        self.commands.lock().take();
    }
}
