//! Structured model of iptables rulesets.
//!
//! The engine reads rulesets with `iptables-save`, decodes the text into
//! tables, chains and rules, and encodes structured rule edits back into
//! command arguments. The model mirrors the save format: a rule keeps both
//! its projected fields and the exact spec text, so unknown matchers pass
//! through untouched.

mod codec;
mod service;
mod transport;

pub use codec::{decode, parse_table, rule_args};
pub use service::{FirewallService, parse_rule_num};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// IP family, selecting the iptables or ip6tables toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpFamily {
    #[default]
    #[serde(rename = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    V6,
}

impl IpFamily {
    pub fn is_v6(&self) -> bool {
        matches!(self, IpFamily::V6)
    }
}

impl FromStr for IpFamily {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ipv4" | "v4" | "" => Ok(IpFamily::V4),
            "ipv6" | "v6" => Ok(IpFamily::V6),
            other => Err(EngineError::Config(format!("unknown ip family: {other}"))),
        }
    }
}

/// The closed set of iptables tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Raw,
    Mangle,
    Nat,
    Filter,
    Security,
}

impl Table {
    /// All known tables, in the order `iptables-save` usually emits them.
    pub const ALL: [Table; 5] = [
        Table::Raw,
        Table::Mangle,
        Table::Nat,
        Table::Filter,
        Table::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Raw => "raw",
            Table::Mangle => "mangle",
            Table::Nat => "nat",
            Table::Filter => "filter",
            Table::Security => "security",
        }
    }
}

impl FromStr for Table {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raw" => Ok(Table::Raw),
            "mangle" => Ok(Table::Mangle),
            "nat" => Ok(Table::Nat),
            "filter" => Ok(Table::Filter),
            "security" => Ok(Table::Security),
            other => Err(EngineError::Config(format!("unknown table: {other}"))),
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chain and its rules, in save order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    /// Default policy; `-` for user-defined chains.
    pub policy: String,
    /// The `[pkts:bytes]` token exactly as it appeared, or empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub counters: String,
    /// A chain is builtin exactly when it carries a real policy.
    pub builtin: bool,
    pub rules: Vec<Rule>,
}

/// One rule: projected fields plus the verbatim spec text.
///
/// Identity within a chain is `chain:num`, where `num` is the dense
/// 1-based position at the time the host was read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// `<chain>:<num>`.
    pub id: String,
    pub num: u32,
    pub chain: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family: String,
    /// `all` when the spec named no protocol.
    pub protocol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest_port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to_port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to_source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// The textual spec exactly as dumped.
    pub spec: String,
}

/// Structured rule edit; encoded into iptables arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInput {
    /// `None` or 0 appends; a positive value inserts at that position.
    #[serde(default)]
    pub num: Option<u32>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub source_ip: String,
    #[serde(default)]
    pub source_port: String,
    #[serde(default)]
    pub dest_ip: String,
    #[serde(default)]
    pub dest_port: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub state: Vec<String>,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub to_port: String,
    #[serde(default)]
    pub to_source: String,
    #[serde(default)]
    pub comment: String,
}

/// One table's chains, in save order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDump {
    pub table: Table,
    pub chains: Vec<Chain>,
}

/// A whole decoded ruleset.
///
/// Tables appear in the order they were received; known tables missing from
/// the dump are appended empty, so every known table is always present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallDump {
    pub tables: Vec<TableDump>,
}

impl FirewallDump {
    pub fn table(&self, table: Table) -> Option<&TableDump> {
        self.tables.iter().find(|t| t.table == table)
    }
}
