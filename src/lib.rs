//! Remote iptables administration engine.
//!
//! Manages a fleet of hosts over SSH: pooled, keep-alive connections with a
//! pluggable authentication chain, privilege elevation (direct root, the
//! sudo fallback ladder, or `su` from an unprivileged login), a command
//! pipeline with PTY, stdin, timeout and cancellation support, and a
//! tolerant codec between `iptables-save` text and a structured
//! tables/chains/rules model.
//!
//! Module map:
//!
//! - `vault`: AEAD sealing of host credentials
//! - `host`: host descriptors, the registry store and service
//! - `auth`: authenticators and the ordered chain
//! - `client`: connection cache, single-flight dial, command execution
//! - `capabilities`: sudo/iptables probing with a TTL cache
//! - `strategy`: privilege elevation strategies
//! - `command`: command model and shell wrapping
//! - `iptables`: ruleset codec, transport and admin operations
//! - `txn`: snapshot/restore transactions
//! - `pool`: bounded worker pool and batch fan-out
//! - `config`: parameter/env/default resolution
//! - `error`: the closed error-kind enum

pub mod auth;
pub mod capabilities;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod host;
pub mod iptables;
pub mod pool;
pub mod strategy;
mod sudo;
pub mod txn;
pub mod vault;

pub use auth::{AuthChain, Authenticator, KeyAuthenticator, PasswordAuthenticator};
pub use capabilities::{CapCache, Capabilities};
pub use client::{ExecResult, Hooks, HostKeyVerifier, InsecureAcceptAll, SshClient};
pub use command::Command;
pub use error::EngineError;
pub use host::{
    CreateHostInput, HostDescriptor, HostService, HostStore, LoginProfile, MemoryHostStore,
    UpdateHostInput,
};
pub use iptables::{Chain, FirewallDump, FirewallService, IpFamily, Rule, RuleInput, Table};
pub use pool::{MemoryTaskStore, Task, TaskStatus, TaskStore, WorkerPool};
pub use strategy::PrivilegeStrategy;
pub use txn::FirewallTxn;
pub use vault::SecretVault;
