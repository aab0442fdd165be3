//! Key-value store gateway.
//!
//! Thin, reconnecting client to the external KV store that holds all durable
//! control-plane state. Exposes string/hash/set/list primitives, pub/sub
//! channels, and watched transactions with optimistic-concurrency semantics:
//! reads happen on a watched connection, writes are staged into a batch, and
//! `exec` applies nothing when a watched key was concurrently modified so the
//! caller can retry from the read.
//!
//! Two backends sit behind the same [`KvStore`] handle: the redis backend used
//! in production, and an embedded in-memory backend with identical semantics
//! used by tests and single-process deployments.

mod keys;
mod memory;
mod redis_backend;
mod store;

pub use keys::KeyNamespace;
pub use store::{KvConfig, KvStore, KvSubscription, WatchedTx, WriteBatch};

/// KV gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Failed to establish a connection to the store
    #[error("KV connection error: {0}")]
    Connection(String),

    /// An individual command failed
    #[error("KV command error: {0}")]
    Command(String),

    /// A watched transaction kept colliding with concurrent writers
    #[error("KV transaction aborted after {0} conflict retries")]
    RetriesExceeded(u32),

    /// A stored value could not be interpreted
    #[error("malformed value at key {key}: {detail}")]
    MalformedValue { key: String, detail: String },
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Command(err.to_string())
    }
}

/// Result type for KV gateway operations.
pub type Result<T> = std::result::Result<T, KvError>;
