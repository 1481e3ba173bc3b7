//! Password authentication from the host's sealed credentials.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::host::{HostDescriptor, LoginProfile, first_non_empty};
use crate::vault::SecretVault;

use super::traits::{AuthAttempt, AuthMethod, Authenticator};

/// Derives a password attempt from the host's login profile.
///
/// Root profile logs in as the root account with the root credential; sudo
/// and user profiles log in as the unprivileged account. A credential that
/// fails to open is downgraded to the empty string by the vault, so a
/// corrupt blob shows up as an ordinary authentication rejection rather
/// than aborting the chain.
#[derive(Debug, Default)]
pub struct PasswordAuthenticator;

impl PasswordAuthenticator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn attempt(
        &self,
        host: &HostDescriptor,
        vault: &SecretVault,
    ) -> Result<Option<AuthAttempt>, EngineError> {
        let (user, password) = match host.profile {
            LoginProfile::Root => (
                first_non_empty(&host.root_user, "root").to_string(),
                vault.open_or_empty(&host.root_pass),
            ),
            LoginProfile::Sudo | LoginProfile::User => {
                (host.user.clone(), vault.open_or_empty(&host.password))
            }
        };
        Ok(Some(AuthAttempt {
            user,
            methods: vec![AuthMethod::Password(password)],
        }))
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
