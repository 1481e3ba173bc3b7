//! Per-host capability probing and caching.
//!
//! Before elevating, the engine wants to know three things about a host:
//! whether `sudo` works without a password, whether the sudoers policy
//! demands a TTY, and where the iptables binary lives. Probing costs a
//! round-trip, so results are memoized in a TTL cache keyed by host
//! address. Probes run lazily, on the first elevated operation.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::SshClient;
use crate::command::Command;
use crate::config;
use crate::sudo::looks_like_require_tty;

/// Fallback path when probing cannot locate the binary.
pub const DEFAULT_IPTABLES_PATH: &str = "/usr/sbin/iptables";

/// Per-probe timeout; a probe may not block the caller longer than this.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Facts discovered about a host.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub sudo_no_pass: bool,
    pub require_tty: bool,
    pub iptables_path: String,
    pub detected_at: Instant,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            sudo_no_pass: false,
            require_tty: false,
            iptables_path: DEFAULT_IPTABLES_PATH.to_string(),
            detected_at: Instant::now(),
        }
    }
}

/// TTL cache of capabilities, keyed by host address.
///
/// Read-mostly: lookups take the read lock, probe results take the write
/// lock only long enough to insert. A TTL of zero means entries never
/// expire; invalidate explicitly when a host's credentials change.
pub struct CapCache {
    items: RwLock<HashMap<String, Capabilities>>,
    ttl: Duration,
}

impl CapCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cache with the TTL from configuration.
    pub fn from_config() -> Self {
        Self::new(config::resolve_cap_ttl(None))
    }

    pub fn get(&self, key: &str) -> Option<Capabilities> {
        let items = self.items.read().expect("capability cache poisoned");
        let caps = items.get(key)?;
        if !self.ttl.is_zero() && caps.detected_at.elapsed() > self.ttl {
            return None;
        }
        Some(caps.clone())
    }

    pub fn set(&self, key: &str, mut caps: Capabilities) {
        caps.detected_at = Instant::now();
        self.items
            .write()
            .expect("capability cache poisoned")
            .insert(key.to_string(), caps);
    }

    /// Drop one host's entry, e.g. after its credentials changed.
    pub fn invalidate(&self, key: &str) {
        self.items
            .write()
            .expect("capability cache poisoned")
            .remove(key);
    }
}

impl SshClient {
    /// Probe (or recall) this host's capabilities.
    ///
    /// The probes run over the plain session rather than through the
    /// elevation ladder: the ladder itself consults the probe result, and
    /// `sudo -n true` is exactly the question being asked.
    pub async fn probe_capabilities(&self, cancel: &CancellationToken) -> Capabilities {
        let key = self.cap_key();
        if let Some(caps) = self.cap_cache().get(&key) {
            return caps;
        }

        let mut caps = Capabilities::default();

        let probe = Command::new("sudo -n true").with_shell(true);
        let r = self
            .raw_run(&probe, Instant::now() + PROBE_TIMEOUT, cancel)
            .await;
        if r.error.is_none() {
            caps.sudo_no_pass = true;
        } else if looks_like_require_tty(&r.stderr) {
            caps.require_tty = true;
        }

        let probe = Command::new("command -v iptables || which iptables").with_shell(true);
        let r = self
            .raw_run(&probe, Instant::now() + PROBE_TIMEOUT, cancel)
            .await;
        if r.error.is_none()
            && let Some(path) = first_line(&r.stdout)
        {
            caps.iptables_path = path;
        }

        debug!(
            host = %self.host().addr,
            sudo_no_pass = caps.sudo_no_pass,
            require_tty = caps.require_tty,
            iptables_path = %caps.iptables_path,
            "capabilities probed"
        );
        self.cap_cache().set(&key, caps.clone());
        caps
    }
}

/// First non-empty line of probe output, trimmed.
fn first_line(s: &str) -> Option<String> {
    let line = s.trim().lines().next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}
