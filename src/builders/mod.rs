//! Builders to construct queue clients from configuration.

pub mod client_builder;

#[cfg(feature = "redis-backend")]
pub use client_builder::{build_redis_client, build_redis_client_from_env};
pub use client_builder::{address_scheme, build_client};
