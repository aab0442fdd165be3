//! Authentication and authorization seam.
//!
//! The control plane does not own an authentication backend; it consults an
//! oracle injected at startup. Deployments wire in their directory service;
//! development and tests use the permissive implementation.

use crate::handler::{HandlerError, Result};
use async_trait::async_trait;

/// External authority for who may connect and who may run models.
#[async_trait]
pub trait AuthOracle: Send + Sync {
    /// Whether the presented credentials identify a real user.
    async fn authenticate(&self, username: &str, user_secret: &str) -> Result<bool>;

    /// Whether an authenticated user may submit model executions.
    async fn authorize(&self, username: &str) -> Result<bool>;
}

/// Accepts any non-empty credentials and authorizes every user.
pub struct PermissiveAuth;

#[async_trait]
impl AuthOracle for PermissiveAuth {
    async fn authenticate(&self, username: &str, user_secret: &str) -> Result<bool> {
        if username.is_empty() {
            return Err(HandlerError::Auth("empty username".to_string()));
        }
        Ok(!user_secret.is_empty())
    }

    async fn authorize(&self, _username: &str) -> Result<bool> {
        Ok(true)
    }
}
