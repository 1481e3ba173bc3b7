//! Symmetric sealing of host credentials.
//!
//! Credentials at rest are AES-256-GCM blobs: `base64(nonce || ciphertext)`
//! with a random 12-byte nonce per seal. The vault is constructed once from
//! the base64-encoded 32-byte master key and handed to components as a
//! value; callers never see the key itself.
//!
//! The empty string round-trips to the empty string in both directions, so
//! "no secret configured" survives seal/open unchanged.
//!
//! `open_or_empty` is the single sanctioned downgrade path: a failed open is
//! logged and treated as an unset secret. Everything else surfaces
//! [`EngineError::Crypto`].

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::OnceCell;
use tracing::warn;

use crate::error::EngineError;

/// Wire nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Master key length in bytes (after base64 decoding).
pub const KEY_LEN: usize = 32;

/// AEAD vault over the process master key.
pub struct SecretVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault").finish_non_exhaustive()
    }
}

impl SecretVault {
    /// Build a vault from the base64-encoded 32-byte master key.
    pub fn new(master_key_b64: &str) -> Result<Self, EngineError> {
        let raw = STANDARD
            .decode(master_key_b64.trim())
            .map_err(|e| EngineError::Config(format!("master key is not valid base64: {e}")))?;
        if raw.len() != KEY_LEN {
            return Err(EngineError::Config(format!(
                "master key must decode to {KEY_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&raw)
            .map_err(|e| EngineError::Crypto(format!("key setup: {e}")))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext secret into its wire form.
    pub fn seal(&self, plain: &str) -> Result<String, EngineError> {
        if plain.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|e| EngineError::Crypto(format!("seal: {e}")))?;
        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(wire))
    }

    /// Decrypt a wire-form secret back to plaintext.
    pub fn open(&self, cipher_b64: &str) -> Result<String, EngineError> {
        if cipher_b64.is_empty() {
            return Ok(String::new());
        }
        let raw = STANDARD
            .decode(cipher_b64)
            .map_err(|e| EngineError::Crypto(format!("open: bad base64: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(EngineError::Crypto("open: ciphertext too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EngineError::Crypto("open: authentication failed".into()))?;
        String::from_utf8(plain).map_err(|_| EngineError::Crypto("open: not utf-8".into()))
    }

    /// Decrypt a secret, downgrading failure to the empty string.
    ///
    /// The failure is logged without any part of the blob or plaintext.
    pub fn open_or_empty(&self, cipher_b64: &str) -> String {
        match self.open(cipher_b64) {
            Ok(plain) => plain,
            Err(err) => {
                warn!(error = %err, "credential decrypt failed, treating secret as unset");
                String::new()
            }
        }
    }
}

static GLOBAL_VAULT: OnceCell<SecretVault> = OnceCell::new();

/// Initialize the process-wide vault exactly once.
///
/// Components still receive the vault explicitly; the global exists for
/// wiring at startup. A second call is a configuration error.
pub fn init_global(master_key_b64: &str) -> Result<(), EngineError> {
    let vault = SecretVault::new(master_key_b64)?;
    GLOBAL_VAULT
        .set(vault)
        .map_err(|_| EngineError::Config("secret vault already initialized".into()))
}

/// The process-wide vault, if [`init_global`] has run.
pub fn global() -> Option<&'static SecretVault> {
    GLOBAL_VAULT.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> SecretVault {
        let key = STANDARD.encode([7u8; KEY_LEN]);
        SecretVault::new(&key).unwrap()
    }

    mod key_handling {
        use super::*;

        #[test]
        fn test_rejects_non_base64_key() {
            let err = SecretVault::new("not base64 !!!").unwrap_err();
            assert_eq!(err.kind(), "config");
        }

        #[test]
        fn test_rejects_wrong_length_key() {
            let short = STANDARD.encode([1u8; 16]);
            let err = SecretVault::new(&short).unwrap_err();
            assert_eq!(err.kind(), "config");
            assert!(err.to_string().contains("32 bytes"));
        }

        #[test]
        fn test_accepts_key_with_surrounding_whitespace() {
            let key = format!("  {}\n", STANDARD.encode([0u8; KEY_LEN]));
            assert!(SecretVault::new(&key).is_ok());
        }
    }

    mod roundtrip {
        use super::*;

        #[test]
        fn test_seal_open_roundtrip() {
            let vault = test_vault();
            let sealed = vault.seal("hunter2").unwrap();
            assert_ne!(sealed, "hunter2");
            assert_eq!(vault.open(&sealed).unwrap(), "hunter2");
        }

        #[test]
        fn test_empty_roundtrips_to_empty() {
            let vault = test_vault();
            assert_eq!(vault.seal("").unwrap(), "");
            assert_eq!(vault.open("").unwrap(), "");
        }

        #[test]
        fn test_nonce_makes_seal_nondeterministic() {
            let vault = test_vault();
            let a = vault.seal("same secret").unwrap();
            let b = vault.seal("same secret").unwrap();
            assert_ne!(a, b);
            assert_eq!(vault.open(&a).unwrap(), vault.open(&b).unwrap());
        }

        #[test]
        fn test_unicode_secret_roundtrip() {
            let vault = test_vault();
            let sealed = vault.seal("密码: pässwörd").unwrap();
            assert_eq!(vault.open(&sealed).unwrap(), "密码: pässwörd");
        }
    }

    mod open_failures {
        use super::*;

        #[test]
        fn test_bad_base64_is_crypto_error() {
            let vault = test_vault();
            assert_eq!(vault.open("!!!").unwrap_err().kind(), "crypto");
        }

        #[test]
        fn test_short_ciphertext_is_crypto_error() {
            let vault = test_vault();
            let blob = STANDARD.encode([0u8; 4]);
            assert_eq!(vault.open(&blob).unwrap_err().kind(), "crypto");
        }

        #[test]
        fn test_tampered_ciphertext_fails_authentication() {
            let vault = test_vault();
            let sealed = vault.seal("secret").unwrap();
            let mut raw = STANDARD.decode(&sealed).unwrap();
            let last = raw.len() - 1;
            raw[last] ^= 0xff;
            let tampered = STANDARD.encode(raw);
            assert_eq!(vault.open(&tampered).unwrap_err().kind(), "crypto");
        }

        #[test]
        fn test_wrong_key_fails_authentication() {
            let vault = test_vault();
            let other = SecretVault::new(&STANDARD.encode([9u8; KEY_LEN])).unwrap();
            let sealed = vault.seal("secret").unwrap();
            assert!(other.open(&sealed).is_err());
        }

        #[test]
        fn test_open_or_empty_downgrades_to_empty() {
            let vault = test_vault();
            assert_eq!(vault.open_or_empty("garbage!!!"), "");
            let sealed = vault.seal("ok").unwrap();
            assert_eq!(vault.open_or_empty(&sealed), "ok");
        }
    }
}
