//! Authenticated session management.
//!
//! Sessions bind a user identity to an opaque secret token valid across one
//! or more websocket connections. Records live in the KV store together with
//! reverse-lookup indexes by secret and by username, plus a monotone id
//! counter. At most one session is active per user: a new authentication
//! removes any prior session.

mod manager;
mod types;

pub use manager::{SessionManager, SessionManagerConfig};
pub use types::{Session, SessionId};

/// Session subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// KV gateway failure
    #[error("session store error: {0}")]
    Store(#[from] crate::kv::KvError),

    /// A persisted record was missing fields or unparseable
    #[error("corrupt session record for id {0}")]
    CorruptRecord(SessionId),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
