//! Ordered chain of authenticators.

use super::key::KeyAuthenticator;
use super::password::PasswordAuthenticator;
use super::traits::Authenticator;

/// Authenticators tried in insertion order.
///
/// The connection manager dials once per produced attempt and stops at the
/// first authenticated connection; declines are skipped silently and the
/// last error is reported when the whole chain fails.
///
/// # Example
///
/// ```ignore
/// let chain = AuthChain::new()
///     .with_key_auth(KeyAuthenticator::new("/etc/fleet/id_ed25519"))
///     .with_password_auth();
/// ```
pub struct AuthChain {
    authenticators: Vec<Box<dyn Authenticator>>,
}

impl AuthChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            authenticators: Vec::new(),
        }
    }

    /// The stock chain: password authentication derived from the host profile.
    pub fn default_chain() -> Self {
        Self::new().with_password_auth()
    }

    /// Append profile-derived password authentication.
    pub fn with_password_auth(mut self) -> Self {
        self.authenticators.push(Box::new(PasswordAuthenticator::new()));
        self
    }

    /// Append key-file authentication.
    pub fn with_key_auth(mut self, auth: KeyAuthenticator) -> Self {
        self.authenticators.push(Box::new(auth));
        self
    }

    /// Append a custom authenticator.
    pub fn with_authenticator(mut self, auth: Box<dyn Authenticator>) -> Self {
        self.authenticators.push(auth);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &dyn Authenticator> {
        self.authenticators.iter().map(Box::as_ref)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.authenticators.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::default_chain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chain_is_empty() {
        assert!(AuthChain::new().is_empty());
    }

    #[test]
    fn test_default_chain_has_password_auth() {
        let chain = AuthChain::default();
        assert_eq!(chain.len(), 1);
        let names: Vec<_> = chain.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["password"]);
    }

    #[test]
    fn test_order_is_preserved() {
        let chain = AuthChain::new()
            .with_key_auth(KeyAuthenticator::new("/k1"))
            .with_password_auth()
            .with_key_auth(KeyAuthenticator::new("/k2"));
        let names: Vec<_> = chain.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["key", "password", "key"]);
    }

    #[test]
    fn test_chain_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthChain>();
    }
}
