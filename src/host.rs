//! Host descriptors and the host registry.
//!
//! A [`HostDescriptor`] is the read contract the engine consumes: endpoint,
//! login profile and sealed credentials. Secrets are stored as vault
//! ciphertexts and never serialize outward.
//!
//! The registry side is split the usual way: a [`HostStore`] trait over the
//! raw records (the in-memory implementation uses `DashMap`; persistent
//! backends plug in behind the same trait) and a [`HostService`] that owns
//! normalization, uniqueness and credential sealing.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::vault::SecretVault;

/// How the engine logs in and gains privilege on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginProfile {
    /// Log in directly as root.
    Root,
    /// Log in as an unprivileged user, elevate with sudo.
    #[default]
    Sudo,
    /// Log in as an unprivileged user, switch to root with `su`.
    User,
}

impl LoginProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginProfile::Root => "root",
            LoginProfile::Sudo => "sudo",
            LoginProfile::User => "user",
        }
    }
}

impl FromStr for LoginProfile {
    type Err = EngineError;

    /// Case-insensitive; the empty string maps to the default profile.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "root" => Ok(LoginProfile::Root),
            "sudo" | "" => Ok(LoginProfile::Sudo),
            "user" => Ok(LoginProfile::User),
            other => Err(EngineError::Config(format!("unknown login profile: {other}"))),
        }
    }
}

/// Read-only description of one managed host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub id: u64,
    pub name: String,
    pub addr: String,
    /// 0 means the default SSH port, 22.
    pub port: u16,
    pub profile: LoginProfile,
    /// Unprivileged login user (profiles `sudo` and `user`).
    pub user: String,
    /// Vault ciphertext of the unprivileged user's password.
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Root account name; empty means `root`.
    pub root_user: String,
    /// Vault ciphertext of the root password.
    #[serde(default, skip_serializing)]
    pub root_pass: String,
}

impl HostDescriptor {
    /// Apply field defaults; call before handing the descriptor to a client.
    pub fn normalized(mut self) -> Self {
        if self.port == 0 {
            self.port = 22;
        }
        self
    }

    /// `addr:port` with the port default applied.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.addr, port_or_default(self.port))
    }

    /// The account name this profile logs in with.
    pub fn login_user(&self) -> &str {
        match self.profile {
            LoginProfile::Root => first_non_empty(&self.root_user, "root"),
            LoginProfile::Sudo | LoginProfile::User => &self.user,
        }
    }

    /// Check the per-profile credential invariants.
    ///
    /// Root needs the root ciphertext, sudo needs the user ciphertext, and
    /// the `user` profile needs both (its own login plus the root secret fed
    /// to `su`).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.addr.trim().is_empty() {
            return Err(EngineError::Config("host address is required".into()));
        }
        match self.profile {
            LoginProfile::Root => {
                if self.root_pass.is_empty() {
                    return Err(EngineError::Config(
                        "root profile requires the root credential".into(),
                    ));
                }
            }
            LoginProfile::Sudo => {
                if self.user.trim().is_empty() || self.password.is_empty() {
                    return Err(EngineError::Config(
                        "sudo profile requires a user and their credential".into(),
                    ));
                }
            }
            LoginProfile::User => {
                if self.user.trim().is_empty()
                    || self.password.is_empty()
                    || self.root_pass.is_empty()
                {
                    return Err(EngineError::Config(
                        "user profile requires the user credential and the root credential"
                            .into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn port_or_default(port: u16) -> u16 {
    if port == 0 { 22 } else { port }
}

pub(crate) fn first_non_empty<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a.trim().is_empty() { b } else { a }
}

/// Storage contract for host records.
///
/// Implementations must be thread-safe and must hand out copies, never
/// aliases of their internal records.
pub trait HostStore: Send + Sync {
    fn create(&self, host: HostDescriptor) -> Result<HostDescriptor, EngineError>;
    fn get(&self, id: u64) -> Result<HostDescriptor, EngineError>;
    fn update(&self, host: HostDescriptor) -> Result<HostDescriptor, EngineError>;
    fn delete(&self, id: u64) -> Result<(), EngineError>;
    /// Delete many; returns how many records actually existed.
    fn batch_delete(&self, ids: &[u64]) -> u64;
    fn list(&self) -> Vec<HostDescriptor>;
    fn find_by_name(&self, name: &str) -> Option<HostDescriptor>;
    fn find_by_endpoint(&self, addr: &str, port: u16) -> Option<HostDescriptor>;
}

/// In-memory `DashMap` host store.
#[derive(Default)]
pub struct MemoryHostStore {
    hosts: DashMap<u64, HostDescriptor>,
    next_id: AtomicU64,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostStore for MemoryHostStore {
    fn create(&self, mut host: HostDescriptor) -> Result<HostDescriptor, EngineError> {
        host.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    fn get(&self, id: u64) -> Result<HostDescriptor, EngineError> {
        self.hosts
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::Config(format!("host {id} not found")))
    }

    fn update(&self, host: HostDescriptor) -> Result<HostDescriptor, EngineError> {
        if !self.hosts.contains_key(&host.id) {
            return Err(EngineError::Config(format!("host {} not found", host.id)));
        }
        self.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    fn delete(&self, id: u64) -> Result<(), EngineError> {
        self.hosts
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EngineError::Config(format!("host {id} not found")))
    }

    fn batch_delete(&self, ids: &[u64]) -> u64 {
        ids.iter()
            .filter(|id| self.hosts.remove(id).is_some())
            .count() as u64
    }

    fn list(&self) -> Vec<HostDescriptor> {
        let mut hosts: Vec<HostDescriptor> =
            self.hosts.iter().map(|entry| entry.value().clone()).collect();
        hosts.sort_by_key(|h| h.id);
        hosts
    }

    fn find_by_name(&self, name: &str) -> Option<HostDescriptor> {
        self.hosts
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.value().clone())
    }

    fn find_by_endpoint(&self, addr: &str, port: u16) -> Option<HostDescriptor> {
        let port = port_or_default(port);
        self.hosts
            .iter()
            .find(|entry| entry.addr == addr && port_or_default(entry.port) == port)
            .map(|entry| entry.value().clone())
    }
}

/// Plaintext input for creating a host; secrets are sealed on the way in.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateHostInput {
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub profile: String,
    pub user: String,
    pub password: String,
    pub root_user: String,
    pub root_pass: String,
}

/// Plaintext input for updating a host. Empty passwords mean "keep current".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateHostInput {
    pub id: u64,
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub profile: String,
    pub user: String,
    pub password: String,
    pub root_user: String,
    pub root_pass: String,
}

/// Registry operations over a [`HostStore`]: trimming, uniqueness on `name`
/// and `(addr, port)`, credential sealing.
pub struct HostService {
    store: Arc<dyn HostStore>,
    vault: Arc<SecretVault>,
}

impl HostService {
    pub fn new(store: Arc<dyn HostStore>, vault: Arc<SecretVault>) -> Self {
        Self { store, vault }
    }

    pub fn list(&self) -> Vec<HostDescriptor> {
        self.store
            .list()
            .into_iter()
            .map(HostDescriptor::normalized)
            .collect()
    }

    pub fn get(&self, id: u64) -> Result<HostDescriptor, EngineError> {
        self.store.get(id).map(HostDescriptor::normalized)
    }

    pub fn create(&self, input: CreateHostInput) -> Result<HostDescriptor, EngineError> {
        let name = input.name.trim().to_string();
        let addr = input.addr.trim().to_string();
        let port = port_or_default(input.port);
        if self.store.find_by_name(&name).is_some() {
            return Err(EngineError::Config("host name already exists".into()));
        }
        if self.store.find_by_endpoint(&addr, port).is_some() {
            return Err(EngineError::Config("address:port already exists".into()));
        }

        let host = HostDescriptor {
            id: 0,
            name,
            addr,
            port,
            profile: input.profile.parse()?,
            user: input.user.trim().to_string(),
            password: self.vault.seal(input.password.trim())?,
            root_user: input.root_user.trim().to_string(),
            root_pass: self.vault.seal(input.root_pass.trim())?,
        }
        .normalized();
        host.validate()?;
        self.store.create(host)
    }

    pub fn update(&self, input: UpdateHostInput) -> Result<HostDescriptor, EngineError> {
        let mut host = self.store.get(input.id)?;

        let name = input.name.trim().to_string();
        let addr = input.addr.trim().to_string();
        let port = port_or_default(input.port);
        if let Some(other) = self.store.find_by_name(&name)
            && other.id != input.id
        {
            return Err(EngineError::Config("host name already exists".into()));
        }
        if let Some(other) = self.store.find_by_endpoint(&addr, port)
            && other.id != input.id
        {
            return Err(EngineError::Config("address:port already exists".into()));
        }

        host.name = name;
        host.addr = addr;
        host.port = port;
        host.profile = input.profile.parse()?;
        host.user = input.user.trim().to_string();
        host.root_user = input.root_user.trim().to_string();
        // Empty plaintext keeps the stored ciphertext.
        if !input.password.trim().is_empty() {
            host.password = self.vault.seal(input.password.trim())?;
        }
        if !input.root_pass.trim().is_empty() {
            host.root_pass = self.vault.seal(input.root_pass.trim())?;
        }

        let host = host.normalized();
        host.validate()?;
        self.store.update(host)
    }

    pub fn delete(&self, id: u64) -> Result<(), EngineError> {
        self.store.delete(id)
    }

    pub fn batch_delete(&self, ids: &[u64]) -> u64 {
        self.store.batch_delete(ids)
    }
}
