//! Websocket request handler.
//!
//! The session-authenticated RPC entry point of the control plane: accepts
//! client connections (optionally over TLS), negotiates sessions against the
//! auth oracle, dispatches typed request messages, and streams asynchronous
//! job updates back to the connected client.

mod auth;
mod dispatch;
pub mod messages;
mod server;
mod updates;

pub use auth::{AuthOracle, PermissiveAuth};
pub use dispatch::RequestHandler;
pub use server::{build_tls_acceptor, run_request_handler_server, TlsSettings};
pub use updates::{run_job_update_stream, UpdateStreamConfig};

/// Request handler errors.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Session manager failure
    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),

    /// Job manager failure
    #[error("job error: {0}")]
    Job(#[from] crate::job::JobError),

    /// Auth oracle failure (not a denial)
    #[error("auth system error: {0}")]
    Auth(String),

    /// TLS identity could not be loaded
    #[error("TLS setup error: {0}")]
    Tls(String),

    /// Socket-level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Websocket protocol failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type for request handler operations.
pub type Result<T> = std::result::Result<T, HandlerError>;
