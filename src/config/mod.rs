//! Configuration models for queue clients.

pub mod client;

pub use client::ClientOptions;
