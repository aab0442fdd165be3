//! KV-backed session manager.

use crate::kv::{KeyNamespace, KvStore, WriteBatch};
use crate::session::{Result, Session, SessionError, SessionId};
use chrono::{Duration, Utc};
use tracing::{debug, info};

/// First id handed out when the counter key does not exist yet.
const INITIAL_SESSION_ID: SessionId = 1;

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Inactivity window after which a session is considered expired.
    pub timeout: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::minutes(30),
        }
    }
}

/// Creates, looks up, refreshes, and removes authenticated sessions.
#[derive(Clone)]
pub struct SessionManager {
    store: KvStore,
    keys: KeyNamespace,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(store: KvStore, keys: KeyNamespace, config: SessionManagerConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    fn session_key(&self, id: SessionId) -> String {
        self.keys.key(&["session", &id.to_string()])
    }

    fn secrets_index_key(&self) -> String {
        self.keys.key(&["all_session_secrets"])
    }

    fn users_index_key(&self) -> String {
        self.keys.key(&["all_users"])
    }

    fn counter_key(&self) -> String {
        self.keys.key(&["next_session_id"])
    }

    /// Create a session for a freshly authenticated user.
    ///
    /// Obtains the next id from the atomic counter (skipping ids whose hash
    /// is already occupied by out-of-band use), removes any prior session for
    /// the same user, and persists the record plus both reverse-lookup
    /// entries in one pipeline.
    pub async fn create(&self, ip_address: &str, username: &str) -> Result<Session> {
        if let Some(existing) = self.lookup_by_username(username).await? {
            debug!(user = username, prior = existing.session_id, "replacing existing session");
            self.remove(&existing).await?;
        }

        let session_id = self.next_session_id().await?;
        let session = Session::new(session_id, ip_address, username);

        let mut batch = WriteBatch::new();
        let session_key = self.session_key(session_id);
        for (field, value) in session.to_fields() {
            batch.hash_set(&session_key, field, &value);
        }
        batch.hash_set(
            &self.secrets_index_key(),
            &session.session_secret,
            &session_id.to_string(),
        );
        batch.hash_set(&self.users_index_key(), username, &session_id.to_string());
        self.store.apply(batch).await?;

        info!(user = username, session_id, "created session");
        Ok(session)
    }

    /// Obtain the next unused session id from the atomic counter.
    async fn next_session_id(&self) -> Result<SessionId> {
        loop {
            let next = self.store.incr(&self.counter_key(), 1).await?;
            let candidate = if next < INITIAL_SESSION_ID as i64 {
                INITIAL_SESSION_ID
            } else {
                next as SessionId
            };
            // An occupied hash means the id was used out of band; skip it and
            // let the counter move past.
            if self.store.hash_len(&self.session_key(candidate)).await? == 0 {
                return Ok(candidate);
            }
            debug!(session_id = candidate, "session id already in use, skipping");
        }
    }

    pub async fn lookup_by_id(&self, session_id: SessionId) -> Result<Option<Session>> {
        let fields = self.store.hash_get_all(&self.session_key(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Session::from_fields(session_id, &fields)
            .map(Some)
            .ok_or(SessionError::CorruptRecord(session_id))
    }

    pub async fn lookup_by_secret(&self, secret: &str) -> Result<Option<Session>> {
        match self.store.hash_get(&self.secrets_index_key(), secret).await? {
            Some(raw_id) => match raw_id.parse::<SessionId>() {
                Ok(id) => self.lookup_by_id(id).await,
                Err(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub async fn lookup_by_username(&self, username: &str) -> Result<Option<Session>> {
        match self.store.hash_get(&self.users_index_key(), username).await? {
            Some(raw_id) => match raw_id.parse::<SessionId>() {
                Ok(id) => self.lookup_by_id(id).await,
                Err(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Refresh a session's last-accessed time.
    ///
    /// Fails (returning `false`) when the session is expired, no longer
    /// persisted, or the caller's secret does not match the stored copy.
    pub async fn refresh(&self, session: &mut Session) -> Result<bool> {
        if session.is_expired(self.config.timeout) {
            return Ok(false);
        }
        let looked_up = match self.lookup_by_id(session.session_id).await? {
            Some(looked_up) => looked_up,
            None => return Ok(false),
        };
        if looked_up.is_expired(self.config.timeout)
            || looked_up.session_secret != session.session_secret
        {
            return Ok(false);
        }

        let now = Utc::now();
        self.store
            .hash_set(
                &self.session_key(session.session_id),
                &[("last_accessed", now.to_rfc3339())],
            )
            .await?;
        session.last_accessed = now;
        Ok(true)
    }

    /// Remove a session record and both of its reverse-lookup entries in one
    /// pipeline.
    pub async fn remove(&self, session: &Session) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(&self.session_key(session.session_id));
        batch.hash_delete(&self.secrets_index_key(), &session.session_secret);
        batch.hash_delete(&self.users_index_key(), &session.user);
        self.store.apply(batch).await?;
        info!(user = %session.user, session_id = session.session_id, "removed session");
        Ok(())
    }
}
