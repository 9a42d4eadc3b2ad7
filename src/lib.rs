//! # Stanchion
//!
//! A bounded-concurrency job queue client and worker library over a list-based
//! broker (push to the tail, blocking pop from the head).
//!
//! Producers enqueue serializable jobs; worker loops consume them under a fixed
//! concurrency ceiling, hand each one to a user-supplied processor and release
//! capacity only once processing completes. Connections survive transient
//! network loss within a bounded retry budget, and shutdown drains in-flight
//! work before closing every connection.
//!
//! ## Core Concepts
//!
//! - **Control connection**: one lazily created connection per client for
//!   `push` and `size`. Losing it for good shuts the whole client down.
//! - **Worker loop**: each `process` call gets its own connection and a ticket
//!   pool sized to the concurrency ceiling. A ticket is taken per outstanding
//!   blocking pop and held until the popped job has been processed.
//! - **Error bus**: every connection, dispatcher and processor error of a client
//!   is fanned out to `on_error` handlers and `subscribe_errors` receivers.
//! - **Shutdown**: happens once. New work is refused, in-flight jobs finish,
//!   then all connections close.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stanchion::config::ClientOptions;
//! use stanchion::core::{processor_fn, QueueClient};
//! use stanchion::infra::broker::InMemoryBroker;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Email { to: String }
//!
//! let client = QueueClient::new(
//!     ClientOptions::default().with_concurrency(4),
//!     InMemoryBroker::new(),
//! )?;
//! client.on_error(|err| eprintln!("queue error: {err}"));
//! client.push(&[Email { to: "a@example.com".into() }]).await?;
//!
//! let worker = client.clone();
//! let handle = tokio::spawn(async move {
//!     worker
//!         .process(processor_fn(|email: Email| async move {
//!             send(&email.to).await
//!         }))
//!         .await
//! });
//!
//! client.shutdown().await?;
//! handle.await??;
//! ```
//!
//! Against Redis, build the client from options instead:
//!
//! ```rust,ignore
//! let client = stanchion::builders::build_redis_client(ClientOptions::from_env()?)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core queue engine: connections, dispatch, processing and shutdown.
pub mod core;
/// Configuration models for queue clients.
pub mod config;
/// Builders to construct clients from configuration.
pub mod builders;
/// Infrastructure adapters for broker backends.
pub mod infra;
/// Runtime adapters for background tasks.
pub mod runtime;
/// Shared utilities.
pub mod util;
