//! Embedded in-memory backend.
//!
//! Mirrors the redis backend's semantics, including watched-transaction
//! conflict detection, using per-key version counters. Used by tests and
//! single-process deployments.

use crate::kv::store::{KvSubscription, WriteBatch, WriteOp};
use crate::kv::Result;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

#[derive(Clone, Default)]
pub(crate) struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    data: RwLock<MemData>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

#[derive(Default)]
struct MemData {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, Vec<String>>,
    // Bumped on every write to a key; watched transactions compare these.
    versions: HashMap<String, u64>,
}

impl MemData {
    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn apply(&mut self, op: &WriteOp) {
        match op {
            WriteOp::Set { key, value } => {
                self.strings.insert(key.clone(), value.clone());
                self.touch(key);
            }
            WriteOp::Incr { key, by } => {
                let current: i64 = self
                    .strings
                    .get(key)
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);
                self.strings.insert(key.clone(), (current + by).to_string());
                self.touch(key);
            }
            WriteOp::Delete { key } => {
                self.strings.remove(key);
                self.hashes.remove(key);
                self.sets.remove(key);
                self.lists.remove(key);
                self.touch(key);
            }
            WriteOp::HashSet { key, field, value } => {
                self.hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
                self.touch(key);
            }
            WriteOp::HashIncr { key, field, by } => {
                let entry = self.hashes.entry(key.clone()).or_default();
                let current: i64 = entry
                    .get(field)
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);
                entry.insert(field.clone(), (current + by).to_string());
                self.touch(key);
            }
            WriteOp::HashDelete { key, field } => {
                if let Some(entry) = self.hashes.get_mut(key) {
                    entry.remove(field);
                }
                self.touch(key);
            }
            WriteOp::SetAdd { key, member } => {
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone());
                self.touch(key);
            }
            WriteOp::SetRemove { key, member } => {
                if let Some(entry) = self.sets.get_mut(key) {
                    entry.remove(member);
                }
                self.touch(key);
            }
            WriteOp::ListPush { key, value } => {
                self.lists
                    .entry(key.clone())
                    .or_default()
                    .push(value.clone());
                self.touch(key);
            }
        }
    }
}

impl MemoryBackend {
    pub(crate) async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.data.read().await.strings.get(key).cloned())
    }

    pub(crate) async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.inner.data.write().await;
        data.apply(&WriteOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    pub(crate) async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut data = self.inner.data.write().await;
        data.apply(&WriteOp::Incr {
            key: key.to_string(),
            by,
        });
        Ok(data
            .strings
            .get(key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<bool> {
        let mut data = self.inner.data.write().await;
        let existed = data.strings.contains_key(key)
            || data.hashes.contains_key(key)
            || data.sets.contains_key(key)
            || data.lists.contains_key(key);
        data.apply(&WriteOp::Delete {
            key: key.to_string(),
        });
        Ok(existed)
    }

    pub(crate) async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .data
            .read()
            .await
            .hashes
            .get(key)
            .and_then(|entry| entry.get(field).cloned()))
    }

    pub(crate) async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .inner
            .data
            .read()
            .await
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    pub(crate) async fn hash_set(&self, key: &str, pairs: &[(&str, String)]) -> Result<()> {
        let mut data = self.inner.data.write().await;
        for (field, value) in pairs {
            data.apply(&WriteOp::HashSet {
                key: key.to_string(),
                field: field.to_string(),
                value: value.clone(),
            });
        }
        Ok(())
    }

    pub(crate) async fn hash_len(&self, key: &str) -> Result<usize> {
        Ok(self
            .inner
            .data
            .read()
            .await
            .hashes
            .get(key)
            .map(|entry| entry.len())
            .unwrap_or(0))
    }

    pub(crate) async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.inner.data.write().await;
        data.apply(&WriteOp::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    pub(crate) async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.inner.data.write().await;
        data.apply(&WriteOp::SetRemove {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    pub(crate) async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .data
            .read()
            .await
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub(crate) async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.inner.data.write().await;
        data.apply(&WriteOp::ListPush {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    pub(crate) async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .data
            .read()
            .await
            .lists
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    pub(crate) async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if let Some(sender) = self.inner.channels.get(channel) {
            // No receivers is fine; pub/sub delivery is best-effort.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    pub(crate) async fn subscribe(&self, channel: &str) -> Result<KvSubscription> {
        let sender = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone();
        let mut broadcast_rx = sender.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(payload) = broadcast_rx.recv().await {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(KvSubscription::new(rx))
    }

    pub(crate) async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut data = self.inner.data.write().await;
        for op in &batch.ops {
            data.apply(op);
        }
        Ok(())
    }

    pub(crate) async fn watch(&self, keys: &[&str]) -> Result<MemoryTx> {
        let data = self.inner.data.read().await;
        let watched = keys
            .iter()
            .map(|key| (key.to_string(), data.version(key)))
            .collect();
        Ok(MemoryTx {
            backend: self.clone(),
            watched,
        })
    }
}

/// Watched transaction against the in-memory backend.
pub(crate) struct MemoryTx {
    backend: MemoryBackend,
    watched: Vec<(String, u64)>,
}

impl MemoryTx {
    pub(crate) async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.backend.get(key).await
    }

    pub(crate) async fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        self.backend.hash_get(key, field).await
    }

    pub(crate) async fn hash_get_all(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.backend.hash_get_all(key).await
    }

    pub(crate) async fn hash_len(&mut self, key: &str) -> Result<usize> {
        self.backend.hash_len(key).await
    }

    pub(crate) async fn exec(self, batch: WriteBatch) -> Result<bool> {
        let mut data = self.backend.inner.data.write().await;
        for (key, version) in &self.watched {
            if data.version(key) != *version {
                return Ok(false);
            }
        }
        for op in &batch.ops {
            data.apply(op);
        }
        Ok(true)
    }

    pub(crate) async fn abort(self) -> Result<()> {
        Ok(())
    }
}
