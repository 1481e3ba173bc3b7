//! Configuration resolution for the engine.
//!
//! Every knob resolves with a three-tier priority:
//!
//! 1. **Parameter** - explicitly provided value (highest priority)
//! 2. **Environment variable**
//! 3. **Default** - built-in value (lowest priority)
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MASTER_KEY` | required | base64 of the 32-byte vault key |
//! | `SSH_DIAL_TIMEOUT` | 10s | TCP + handshake timeout in seconds |
//! | `SSH_CMD_TIMEOUT` | 30s | default command timeout in seconds |
//! | `SSH_KEEPALIVE` | 30s | keep-alive interval in seconds (0 disables) |
//! | `CAP_CACHE_TTL` | 600s | capability cache TTL in seconds (0 = no expiry) |
//! | `POOL_WORKERS` | 8 | worker-pool size |

use std::env;
use std::time::Duration;

use crate::error::EngineError;

/// Default TCP connect + SSH handshake timeout in seconds.
pub(crate) const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;

/// Default per-command timeout in seconds, used when a command carries none.
pub(crate) const DEFAULT_CMD_TIMEOUT_SECS: u64 = 30;

/// Default keep-alive interval in seconds.
pub(crate) const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Default capability cache TTL in seconds.
pub(crate) const DEFAULT_CAP_TTL_SECS: u64 = 600;

/// Default worker-pool size.
pub(crate) const DEFAULT_POOL_WORKERS: usize = 8;

pub(crate) const MASTER_KEY_ENV_VAR: &str = "MASTER_KEY";
pub(crate) const DIAL_TIMEOUT_ENV_VAR: &str = "SSH_DIAL_TIMEOUT";
pub(crate) const CMD_TIMEOUT_ENV_VAR: &str = "SSH_CMD_TIMEOUT";
pub(crate) const KEEPALIVE_ENV_VAR: &str = "SSH_KEEPALIVE";
pub(crate) const CAP_TTL_ENV_VAR: &str = "CAP_CACHE_TTL";
pub(crate) const POOL_WORKERS_ENV_VAR: &str = "POOL_WORKERS";

fn resolve_secs(param: Option<u64>, env_var: &str, default: u64) -> Duration {
    if let Some(secs) = param {
        return Duration::from_secs(secs);
    }
    if let Ok(raw) = env::var(env_var)
        && let Ok(secs) = raw.parse::<u64>()
    {
        return Duration::from_secs(secs);
    }
    Duration::from_secs(default)
}

/// Resolve the dial timeout with priority: parameter -> env var -> default.
pub fn resolve_dial_timeout(param: Option<u64>) -> Duration {
    resolve_secs(param, DIAL_TIMEOUT_ENV_VAR, DEFAULT_DIAL_TIMEOUT_SECS)
}

/// Resolve the default command timeout with priority: parameter -> env var -> default.
pub fn resolve_cmd_timeout(param: Option<u64>) -> Duration {
    resolve_secs(param, CMD_TIMEOUT_ENV_VAR, DEFAULT_CMD_TIMEOUT_SECS)
}

/// Resolve the keep-alive interval. Zero disables keep-alive entirely.
pub fn resolve_keepalive(param: Option<u64>) -> Duration {
    resolve_secs(param, KEEPALIVE_ENV_VAR, DEFAULT_KEEPALIVE_SECS)
}

/// Resolve the capability cache TTL. Zero means entries never expire.
pub fn resolve_cap_ttl(param: Option<u64>) -> Duration {
    resolve_secs(param, CAP_TTL_ENV_VAR, DEFAULT_CAP_TTL_SECS)
}

/// Resolve the worker-pool size with priority: parameter -> env var -> default.
pub fn resolve_pool_workers(param: Option<usize>) -> usize {
    if let Some(workers) = param
        && workers > 0
    {
        return workers;
    }
    if let Ok(raw) = env::var(POOL_WORKERS_ENV_VAR)
        && let Ok(workers) = raw.parse::<usize>()
        && workers > 0
    {
        return workers;
    }
    DEFAULT_POOL_WORKERS
}

/// Read the vault master key from the environment.
///
/// Missing key is a fatal configuration error; the value itself is validated
/// (base64, 32 bytes) by [`crate::vault::SecretVault::new`].
pub fn resolve_master_key() -> Result<String, EngineError> {
    match env::var(MASTER_KEY_ENV_VAR) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(EngineError::Config(format!(
            "{MASTER_KEY_ENV_VAR} is required (base64 of 32 bytes)"
        ))),
    }
}
