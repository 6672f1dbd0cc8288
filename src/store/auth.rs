//! The single authentication capability the broker consumes.

use crate::error::AuthError;
use async_trait::async_trait;

/// The identity an authenticator vouches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrincipal {
    pub client_id: String,
    pub username: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<AuthPrincipal, AuthError>;
}

/// Accepts every connection; the default when no authenticator is wired in.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> Result<AuthPrincipal, AuthError> {
        Ok(AuthPrincipal {
            client_id: client_id.to_string(),
            username: username.map(str::to_string),
        })
    }
}
