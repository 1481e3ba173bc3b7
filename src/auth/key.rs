//! Private key file authentication.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys;

use crate::error::EngineError;
use crate::host::{HostDescriptor, LoginProfile, first_non_empty};
use crate::vault::SecretVault;

use super::traits::{AuthAttempt, AuthMethod, Authenticator};

/// Loads a private key from disk for public key authentication.
///
/// The user override wins over the profile-implied login user, which lets a
/// shared automation key log in under an account the descriptor does not
/// mention.
pub struct KeyAuthenticator {
    key_path: PathBuf,
    passphrase: Option<String>,
    user_override: Option<String>,
}

impl KeyAuthenticator {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            passphrase: None,
            user_override: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user_override = Some(user.into());
        self
    }

    fn implied_user(&self, host: &HostDescriptor) -> String {
        if let Some(user) = &self.user_override
            && !user.trim().is_empty()
        {
            return user.clone();
        }
        match host.profile {
            LoginProfile::Root => first_non_empty(&host.root_user, "root").to_string(),
            LoginProfile::Sudo | LoginProfile::User => host.user.clone(),
        }
    }
}

#[async_trait]
impl Authenticator for KeyAuthenticator {
    async fn attempt(
        &self,
        host: &HostDescriptor,
        _vault: &SecretVault,
    ) -> Result<Option<AuthAttempt>, EngineError> {
        let path = Path::new(&self.key_path);
        let passphrase = self
            .passphrase
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let key = keys::load_secret_key(path, passphrase).map_err(|e| {
            EngineError::Auth(format!("load key {}: {e}", self.key_path.display()))
        })?;
        Ok(Some(AuthAttempt {
            user: self.implied_user(host),
            methods: vec![AuthMethod::Key(Arc::new(key))],
        }))
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    fn vault() -> SecretVault {
        SecretVault::new(&STANDARD.encode([5u8; 32])).unwrap()
    }

    fn host(profile: LoginProfile) -> HostDescriptor {
        HostDescriptor {
            addr: "10.0.0.1".into(),
            profile,
            user: "deploy".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_user_override_wins() {
        let auth = KeyAuthenticator::new("/tmp/id_ed25519").with_user("ops");
        assert_eq!(auth.implied_user(&host(LoginProfile::Sudo)), "ops");
        assert_eq!(auth.implied_user(&host(LoginProfile::Root)), "ops");
    }

    #[test]
    fn test_blank_override_falls_back_to_profile() {
        let auth = KeyAuthenticator::new("/tmp/id_ed25519").with_user("  ");
        assert_eq!(auth.implied_user(&host(LoginProfile::Sudo)), "deploy");
        assert_eq!(auth.implied_user(&host(LoginProfile::Root)), "root");
    }

    #[test]
    fn test_root_profile_honors_root_user() {
        let auth = KeyAuthenticator::new("/tmp/id_ed25519");
        let mut h = host(LoginProfile::Root);
        h.root_user = "admin".into();
        assert_eq!(auth.implied_user(&h), "admin");
    }

    #[tokio::test]
    async fn test_missing_key_file_is_an_auth_error() {
        let auth = KeyAuthenticator::new("/nonexistent/path/id_rsa");
        let err = auth
            .attempt(&host(LoginProfile::Sudo), &vault())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "auth");
        assert!(err.to_string().contains("/nonexistent/path/id_rsa"));
    }

    #[test]
    fn test_name() {
        assert_eq!(KeyAuthenticator::new("/k").name(), "key");
    }
}
