//! Redis backend for the KV gateway.
//!
//! Routine commands go through a shared multiplexed connection. Watched
//! transactions open a dedicated connection so WATCH/MULTI/EXEC state cannot
//! interleave with other callers.

use crate::kv::store::{KvConfig, KvSubscription, WriteBatch, WriteOp};
use crate::kv::{KvError, Result};
use futures::StreamExt;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone)]
pub(crate) struct RedisBackend {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBackend {
    pub(crate) async fn connect(config: &KvConfig) -> Result<Self> {
        let url = match &config.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, config.host, config.port),
            None => format!("redis://{}:{}/", config.host, config.port),
        };
        let client =
            redis::Client::open(url).map_err(|err| KvError::Connection(err.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| KvError::Connection(err.to_string()))?;
        Ok(Self { client, conn })
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    pub(crate) async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        Ok(conn.set(key, value).await?)
    }

    pub(crate) async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, by).await?)
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    pub(crate) async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    pub(crate) async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    pub(crate) async fn hash_set(&self, key: &str, pairs: &[(&str, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        Ok(conn.hset_multiple(key, pairs).await?)
    }

    pub(crate) async fn hash_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(key).await?)
    }

    pub(crate) async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        Ok(conn.sadd(key, member).await?)
    }

    pub(crate) async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        Ok(conn.srem(key, member).await?)
    }

    pub(crate) async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    pub(crate) async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        Ok(conn.rpush(key, value).await?)
    }

    pub(crate) async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    pub(crate) async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    pub(crate) async fn subscribe(&self, channel: &str) -> Result<KvSubscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| KvError::Connection(err.to_string()))?;
        pubsub.subscribe(channel).await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        debug!("dropping undecodable pub/sub payload: {err}");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(KvSubscription::new(rx))
    }

    pub(crate) async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        stage_ops(&mut pipe, &batch);
        let _: redis::Value = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub(crate) async fn watch(&self, keys: &[&str]) -> Result<RedisTx> {
        // Dedicated connection: WATCH state is per-connection.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| KvError::Connection(err.to_string()))?;
        let mut cmd = redis::cmd("WATCH");
        for key in keys {
            cmd.arg(*key);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(RedisTx { conn })
    }
}

fn stage_ops(pipe: &mut redis::Pipeline, batch: &WriteBatch) {
    for op in &batch.ops {
        match op {
            WriteOp::Set { key, value } => {
                pipe.set(key, value).ignore();
            }
            WriteOp::Incr { key, by } => {
                pipe.cmd("INCRBY").arg(key).arg(by).ignore();
            }
            WriteOp::Delete { key } => {
                pipe.del(key).ignore();
            }
            WriteOp::HashSet { key, field, value } => {
                pipe.hset(key, field, value).ignore();
            }
            WriteOp::HashIncr { key, field, by } => {
                pipe.cmd("HINCRBY").arg(key).arg(field).arg(by).ignore();
            }
            WriteOp::HashDelete { key, field } => {
                pipe.hdel(key, field).ignore();
            }
            WriteOp::SetAdd { key, member } => {
                pipe.sadd(key, member).ignore();
            }
            WriteOp::SetRemove { key, member } => {
                pipe.srem(key, member).ignore();
            }
            WriteOp::ListPush { key, value } => {
                pipe.rpush(key, value).ignore();
            }
        }
    }
}

/// Watched transaction holding its own connection.
pub(crate) struct RedisTx {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisTx {
    pub(crate) async fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.conn.get(key).await?)
    }

    pub(crate) async fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.conn.hget(key, field).await?)
    }

    pub(crate) async fn hash_get_all(&mut self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.conn.hgetall(key).await?)
    }

    pub(crate) async fn hash_len(&mut self, key: &str) -> Result<usize> {
        Ok(self.conn.hlen(key).await?)
    }

    pub(crate) async fn exec(mut self, batch: WriteBatch) -> Result<bool> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        stage_ops(&mut pipe, &batch);
        // EXEC replies nil when a watched key changed since WATCH.
        let outcome: Option<redis::Value> = pipe.query_async(&mut self.conn).await?;
        Ok(outcome.is_some())
    }

    pub(crate) async fn abort(mut self) -> Result<()> {
        let _: () = redis::cmd("UNWATCH").query_async(&mut self.conn).await?;
        Ok(())
    }
}
