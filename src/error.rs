//! Error types for reliq operations.
//!
//! Two families of failures exist:
//!
//! - `ConfigError`: invalid tunables, raised at setup time and never
//!   deferred.
//! - `StoreError`: anything that went wrong talking to Redis. Transient by
//!   nature; the hot fetch path propagates these to the caller's loop,
//!   background tasks log them and retry on their next tick.
//!
//! Losing a lease race is not an error and is reported as a plain `bool`
//! by the lease API.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An interval tunable was set to zero.
    #[error("Invalid '{name}' interval: {value:?}. Must be greater than zero")]
    InvalidInterval {
        name: &'static str,
        value: Duration,
    },

    /// No queues were configured to watch.
    #[error("At least one queue must be configured")]
    NoQueues,

    /// The process identity string is empty.
    #[error("Process identity must not be empty")]
    EmptyIdentity,
}

/// Errors raised by operations against the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis was unreachable or an operation failed/timed out.
    #[error("Redis unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    /// A registry entry could not be decoded as a JSON queue list.
    #[error("Malformed registry entry for process '{identity}': {source}")]
    MalformedRegistry {
        identity: String,
        #[source]
        source: serde_json::Error,
    },

    /// Failed to serialize a value destined for the store.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
