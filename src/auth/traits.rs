//! Authenticator trait and attempt types.

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PrivateKey;

use crate::error::EngineError;
use crate::host::HostDescriptor;
use crate::vault::SecretVault;

/// One SSH authentication method, ready to apply to a connection.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    /// A loaded private key; the dialer pairs it with the server's best
    /// supported RSA hash at authentication time.
    Key(Arc<PrivateKey>),
}

impl std::fmt::Debug for AuthMethod {
    // Never expose the password in debug output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::Key(_) => f.write_str("Key(..)"),
        }
    }
}

/// A login user plus the auth methods to try, built per dial and dropped
/// after the dial settles.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    pub user: String,
    pub methods: Vec<AuthMethod>,
}

/// A source of authentication attempts.
///
/// Implementations must be thread-safe (`Send + Sync`). Returning
/// `Ok(None)` declines the host without failing the chain; errors are
/// recorded as the chain's last cause and the next authenticator runs.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Produce an attempt for this host, or decline.
    async fn attempt(
        &self,
        host: &HostDescriptor,
        vault: &SecretVault,
    ) -> Result<Option<AuthAttempt>, EngineError>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}
