//! The gateway handle and its transaction primitives.

use crate::kv::memory::{MemoryBackend, MemoryTx};
use crate::kv::redis_backend::{RedisBackend, RedisTx};
use crate::kv::{KvError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Attempts made to reach the store at startup.
const CONNECT_ATTEMPTS: u32 = 5;

/// Spacing between connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connection parameters for the external KV store.
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl KvConfig {
    /// Resolve connection parameters from the environment and Docker secrets.
    pub fn from_env() -> Self {
        Self {
            host: crate::env::redis_host(),
            port: crate::env::redis_port(),
            password: crate::env::redis_password(),
        }
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: crate::env::DEFAULT_REDIS_HOST.to_string(),
            port: crate::env::DEFAULT_REDIS_PORT,
            password: None,
        }
    }
}

/// Handle to the KV store.
///
/// Cheap to clone; all clones share the underlying connection.
#[derive(Clone)]
pub struct KvStore {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Redis(RedisBackend),
    Memory(MemoryBackend),
}

impl KvStore {
    /// Connect to the external store, retrying a bounded number of times.
    pub async fn connect(config: KvConfig) -> Result<Self> {
        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match RedisBackend::connect(&config).await {
                Ok(backend) => {
                    info!(host = %config.host, port = config.port, "connected to KV store");
                    return Ok(Self {
                        backend: Backend::Redis(backend),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = CONNECT_ATTEMPTS,
                        "KV store connection failed: {err}"
                    );
                    last_error = Some(err);
                }
            }
            if attempt < CONNECT_ATTEMPTS {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
        Err(last_error
            .unwrap_or_else(|| KvError::Connection("no connection attempts made".to_string())))
    }

    /// Create a store backed by the embedded in-memory backend.
    ///
    /// Used by tests and single-process deployments; state does not survive
    /// the process.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(MemoryBackend::default()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match &self.backend {
            Backend::Redis(b) => b.get(key).await,
            Backend::Memory(b) => b.get(key).await,
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(b) => b.set(key, value).await,
            Backend::Memory(b) => b.set(key, value).await,
        }
    }

    /// Atomically increment a counter key, returning the new value.
    pub async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        match &self.backend {
            Backend::Redis(b) => b.incr(key, by).await,
            Backend::Memory(b) => b.incr(key, by).await,
        }
    }

    /// Delete a key. Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        match &self.backend {
            Backend::Redis(b) => b.delete(key).await,
            Backend::Memory(b) => b.delete(key).await,
        }
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        match &self.backend {
            Backend::Redis(b) => b.hash_get(key, field).await,
            Backend::Memory(b) => b.hash_get(key, field).await,
        }
    }

    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        match &self.backend {
            Backend::Redis(b) => b.hash_get_all(key).await,
            Backend::Memory(b) => b.hash_get_all(key).await,
        }
    }

    pub async fn hash_set(&self, key: &str, pairs: &[(&str, String)]) -> Result<()> {
        match &self.backend {
            Backend::Redis(b) => b.hash_set(key, pairs).await,
            Backend::Memory(b) => b.hash_set(key, pairs).await,
        }
    }

    pub async fn hash_len(&self, key: &str) -> Result<usize> {
        match &self.backend {
            Backend::Redis(b) => b.hash_len(key).await,
            Backend::Memory(b) => b.hash_len(key).await,
        }
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(b) => b.set_add(key, member).await,
            Backend::Memory(b) => b.set_add(key, member).await,
        }
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(b) => b.set_remove(key, member).await,
            Backend::Memory(b) => b.set_remove(key, member).await,
        }
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Redis(b) => b.set_members(key).await,
            Backend::Memory(b) => b.set_members(key).await,
        }
    }

    /// Append a value to the list at `key`.
    pub async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(b) => b.list_push(key, value).await,
            Backend::Memory(b) => b.list_push(key, value).await,
        }
    }

    /// Read the full list at `key` in insertion order.
    pub async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Redis(b) => b.list_range(key).await,
            Backend::Memory(b) => b.list_range(key).await,
        }
    }

    /// Publish a payload on a channel. Delivery is best-effort.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(b) => b.publish(channel, payload).await,
            Backend::Memory(b) => b.publish(channel, payload).await,
        }
    }

    /// Subscribe to a channel, receiving payloads published after this call.
    pub async fn subscribe(&self, channel: &str) -> Result<KvSubscription> {
        match &self.backend {
            Backend::Redis(b) => b.subscribe(channel).await,
            Backend::Memory(b) => b.subscribe(channel).await,
        }
    }

    /// Apply a write batch as one atomic pipeline without watching any keys.
    pub async fn apply(&self, batch: WriteBatch) -> Result<()> {
        match &self.backend {
            Backend::Redis(b) => b.apply(batch).await,
            Backend::Memory(b) => b.apply(batch).await,
        }
    }

    /// Begin a watched transaction over the given keys.
    ///
    /// Reads performed through the returned [`WatchedTx`] observe the store
    /// directly; writes are staged and applied by [`WatchedTx::exec`], which
    /// reports `false` (applying nothing) when any watched key was modified
    /// since the watch began.
    pub async fn watch(&self, keys: &[&str]) -> Result<WatchedTx> {
        let inner = match &self.backend {
            Backend::Redis(b) => TxInner::Redis(b.watch(keys).await?),
            Backend::Memory(b) => TxInner::Memory(b.watch(keys).await?),
        };
        Ok(WatchedTx {
            inner,
            batch: WriteBatch::new(),
        })
    }
}

/// A staged set of write operations applied atomically.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub(crate) ops: Vec<WriteOp>,
}

/// A single staged write.
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Set { key: String, value: String },
    Incr { key: String, by: i64 },
    Delete { key: String },
    HashSet { key: String, field: String, value: String },
    HashIncr { key: String, field: String, by: i64 },
    HashDelete { key: String, field: String },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
    ListPush { key: String, value: String },
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.ops.push(WriteOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn incr(&mut self, key: &str, by: i64) -> &mut Self {
        self.ops.push(WriteOp::Incr {
            key: key.to_string(),
            by,
        });
        self
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            key: key.to_string(),
        });
        self
    }

    pub fn hash_set(&mut self, key: &str, field: &str, value: &str) -> &mut Self {
        self.ops.push(WriteOp::HashSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn hash_incr(&mut self, key: &str, field: &str, by: i64) -> &mut Self {
        self.ops.push(WriteOp::HashIncr {
            key: key.to_string(),
            field: field.to_string(),
            by,
        });
        self
    }

    pub fn hash_delete(&mut self, key: &str, field: &str) -> &mut Self {
        self.ops.push(WriteOp::HashDelete {
            key: key.to_string(),
            field: field.to_string(),
        });
        self
    }

    pub fn set_add(&mut self, key: &str, member: &str) -> &mut Self {
        self.ops.push(WriteOp::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn set_remove(&mut self, key: &str, member: &str) -> &mut Self {
        self.ops.push(WriteOp::SetRemove {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn list_push(&mut self, key: &str, value: &str) -> &mut Self {
        self.ops.push(WriteOp::ListPush {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }
}

/// An in-progress watched transaction.
pub struct WatchedTx {
    inner: TxInner,
    batch: WriteBatch,
}

enum TxInner {
    Redis(RedisTx),
    Memory(MemoryTx),
}

impl WatchedTx {
    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        match &mut self.inner {
            TxInner::Redis(tx) => tx.get(key).await,
            TxInner::Memory(tx) => tx.get(key).await,
        }
    }

    pub async fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        match &mut self.inner {
            TxInner::Redis(tx) => tx.hash_get(key, field).await,
            TxInner::Memory(tx) => tx.hash_get(key, field).await,
        }
    }

    pub async fn hash_get_all(&mut self, key: &str) -> Result<HashMap<String, String>> {
        match &mut self.inner {
            TxInner::Redis(tx) => tx.hash_get_all(key).await,
            TxInner::Memory(tx) => tx.hash_get_all(key).await,
        }
    }

    pub async fn hash_len(&mut self, key: &str) -> Result<usize> {
        match &mut self.inner {
            TxInner::Redis(tx) => tx.hash_len(key).await,
            TxInner::Memory(tx) => tx.hash_len(key).await,
        }
    }

    /// Access the staged write batch.
    pub fn stage(&mut self) -> &mut WriteBatch {
        &mut self.batch
    }

    /// Attempt to commit the staged writes.
    ///
    /// Returns `false` without applying anything when a watched key was
    /// concurrently modified; the caller should retry from its read.
    pub async fn exec(self) -> Result<bool> {
        match self.inner {
            TxInner::Redis(tx) => tx.exec(self.batch).await,
            TxInner::Memory(tx) => tx.exec(self.batch).await,
        }
    }

    /// Abandon the transaction, releasing the watch without writing.
    pub async fn abort(self) -> Result<()> {
        match self.inner {
            TxInner::Redis(tx) => tx.abort().await,
            TxInner::Memory(tx) => tx.abort().await,
        }
    }
}

/// Receiving side of a channel subscription.
pub struct KvSubscription {
    rx: mpsc::Receiver<String>,
}

impl KvSubscription {
    pub(crate) fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Await the next published payload. Returns `None` when the channel is
    /// gone (connection lost or backend dropped).
    pub async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_string_roundtrip() {
        let store = KvStore::in_memory();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_counter() {
        let store = KvStore::in_memory();
        assert_eq!(store.incr("n", 1).await.unwrap(), 1);
        assert_eq!(store.incr("n", 1).await.unwrap(), 2);
        assert_eq!(store.incr("n", -2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_hash_and_set_ops() {
        let store = KvStore::in_memory();
        store
            .hash_set("h", &[("a", "1".to_string()), ("b", "2".to_string())])
            .await
            .unwrap();
        assert_eq!(store.hash_len("h").await.unwrap(), 2);
        assert_eq!(
            store.hash_get("h", "a").await.unwrap(),
            Some("1".to_string())
        );
        store.set_add("s", "x").await.unwrap();
        store.set_add("s", "x").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap().len(), 1);
        store.set_remove("s", "x").await.unwrap();
        assert!(store.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_list_preserves_order() {
        let store = KvStore::in_memory();
        for id in ["n0", "n1", "n2"] {
            store.list_push("order", id).await.unwrap();
        }
        assert_eq!(store.list_range("order").await.unwrap(), ["n0", "n1", "n2"]);
    }

    #[tokio::test]
    async fn test_watched_tx_commits_without_conflict() {
        let store = KvStore::in_memory();
        store.set("counter", "5").await.unwrap();

        let mut tx = store.watch(&["counter"]).await.unwrap();
        let current: i64 = tx.get("counter").await.unwrap().unwrap().parse().unwrap();
        tx.stage().set("counter", &(current + 1).to_string());
        assert!(tx.exec().await.unwrap());
        assert_eq!(store.get("counter").await.unwrap(), Some("6".to_string()));
    }

    #[tokio::test]
    async fn test_watched_tx_aborts_on_conflict() {
        let store = KvStore::in_memory();
        store.set("counter", "5").await.unwrap();

        let mut tx = store.watch(&["counter"]).await.unwrap();
        let _ = tx.get("counter").await.unwrap();
        // A concurrent writer lands between the read and the commit.
        store.set("counter", "50").await.unwrap();
        tx.stage().set("counter", "6");
        assert!(!tx.exec().await.unwrap());
        assert_eq!(store.get("counter").await.unwrap(), Some("50".to_string()));
    }

    #[tokio::test]
    async fn test_pubsub_delivery() {
        let store = KvStore::in_memory();
        let mut sub = store.subscribe("events").await.unwrap();
        store.publish("events", "hello").await.unwrap();
        let received = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            sub.next_message(),
        )
        .await
        .unwrap();
        assert_eq!(received, Some("hello".to_string()));
    }
}
