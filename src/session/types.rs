//! Session records and secret generation.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Unique identifier for sessions. Assigned monotonically, never reused.
pub type SessionId = u64;

/// An authenticated session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub session_secret: String,
    pub created: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub ip_address: String,
    pub user: String,
}

impl Session {
    /// Create a fresh session for an authenticated user, generating a new
    /// secret token.
    pub fn new(session_id: SessionId, ip_address: impl Into<String>, user: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            session_secret: generate_secret(),
            created: now,
            last_accessed: now,
            ip_address: ip_address.into(),
            user: user.into(),
        }
    }

    /// Whether the session has gone unused longer than `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        Utc::now() - self.last_accessed > timeout
    }

    /// Serialize to the persisted hash field layout.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("secret", self.session_secret.clone()),
            ("created", self.created.to_rfc3339()),
            ("last_accessed", self.last_accessed.to_rfc3339()),
            ("ip_address", self.ip_address.clone()),
            ("user", self.user.clone()),
        ]
    }

    /// Reconstruct from the persisted hash field layout. Returns `None` when
    /// fields are missing or unparseable.
    pub fn from_fields(session_id: SessionId, fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            session_id,
            session_secret: fields.get("secret")?.clone(),
            created: parse_timestamp(fields.get("created")?)?,
            last_accessed: parse_timestamp(fields.get("last_accessed")?)?,
            ip_address: fields.get("ip_address")?.clone(),
            user: fields.get("user")?.clone(),
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Generate a session secret: the hex SHA-256 digest of 32 random bytes.
fn generate_secret() -> String {
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    hex::encode(Sha256::digest(seed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_unique_hex_digests() {
        let a = Session::new(1, "10.0.0.2", "u1");
        let b = Session::new(2, "10.0.0.2", "u1");
        assert_ne!(a.session_secret, b.session_secret);
        assert_eq!(a.session_secret.len(), 64);
        assert!(a.session_secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_field_roundtrip() {
        let session = Session::new(7, "192.168.0.10", "operator");
        let fields: HashMap<String, String> = session
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let restored = Session::from_fields(7, &fields).unwrap();
        assert_eq!(restored, session);
    }

    #[test]
    fn test_expiry() {
        let mut session = Session::new(1, "10.0.0.2", "u1");
        assert!(!session.is_expired(Duration::minutes(30)));
        session.last_accessed = Utc::now() - Duration::minutes(31);
        assert!(session.is_expired(Duration::minutes(30)));
    }
}
