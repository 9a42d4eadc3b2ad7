//! Build queue clients from options and a broker factory.

#[cfg(feature = "redis-backend")]
use anyhow::Context;

use crate::config::ClientOptions;
#[cfg(feature = "redis-backend")]
use crate::core::AppResult;
use crate::core::{QueueClient, QueueError};
use crate::infra::broker::Broker;
#[cfg(feature = "redis-backend")]
use crate::infra::broker::RedisBroker;

/// Scheme of a broker address, e.g. `redis` for `redis://host:6379`.
///
/// # Errors
///
/// Returns [`QueueError::InvalidConfig`] if the address has no `scheme://` prefix.
pub fn address_scheme(address: &str) -> Result<&str, QueueError> {
    match address.split_once("://") {
        Some((scheme, _)) if !scheme.is_empty() => Ok(scheme),
        _ => Err(QueueError::InvalidConfig(format!(
            "broker address `{address}` has no scheme"
        ))),
    }
}

/// Validate `options`, build a broker with `broker_factory` and wrap it in a client.
///
/// The factory receives the address scheme and the validated options.
///
/// # Errors
///
/// Returns [`QueueError::InvalidConfig`] for invalid options or addresses, or
/// whatever the factory returns.
pub fn build_client<B, F>(options: ClientOptions, broker_factory: F) -> Result<QueueClient<B>, QueueError>
where
    B: Broker,
    F: FnOnce(&str, &ClientOptions) -> Result<B, QueueError>,
{
    options
        .validate()
        .map_err(|e| QueueError::InvalidConfig(format!("config invalid: {e}")))?;
    let scheme = address_scheme(&options.address)?;
    let broker = broker_factory(scheme, &options)?;
    tracing::debug!(scheme, broker = %broker.describe(), "broker built from options");
    QueueClient::new(options, broker)
}

/// Build a client backed by Redis (`redis://` or `rediss://` addresses).
///
/// # Errors
///
/// Returns [`QueueError::InvalidConfig`] for other schemes or unparsable URLs.
#[cfg(feature = "redis-backend")]
pub fn build_redis_client(options: ClientOptions) -> Result<QueueClient<RedisBroker>, QueueError> {
    build_client(options, |scheme, options| match scheme {
        "redis" | "rediss" => RedisBroker::open(&options.address, options.health_check_interval())
            .map_err(|e| QueueError::InvalidConfig(e.to_string())),
        other => Err(QueueError::InvalidConfig(format!(
            "unsupported broker scheme `{other}`"
        ))),
    })
}

/// Read options from the environment (see [`ClientOptions::from_env`]) and build a
/// Redis-backed client from them.
///
/// # Errors
///
/// Fails if the environment holds invalid options or the address is not a Redis URL.
#[cfg(feature = "redis-backend")]
pub fn build_redis_client_from_env() -> AppResult<QueueClient<RedisBroker>> {
    let options = ClientOptions::from_env()
        .map_err(anyhow::Error::msg)
        .context("loading client options from the environment")?;
    let client = build_redis_client(options).context("building redis queue client")?;
    Ok(client)
}
