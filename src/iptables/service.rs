//! Registry-backed firewall operations.
//!
//! Resolves a host out of the registry, builds a client for it and runs the
//! chain and rule operations the admin surface exposes. Clients share one
//! capability cache so the probe runs once per host, not once per request.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::capabilities::CapCache;
use crate::client::{HostKeyVerifier, InsecureAcceptAll, SshClient};
use crate::error::EngineError;
use crate::host::HostStore;
use crate::vault::SecretVault;

use super::{Chain, FirewallDump, IpFamily, Rule, RuleInput, Table, codec};

/// Chain and rule administration over registered hosts.
pub struct FirewallService {
    store: Arc<dyn HostStore>,
    vault: Arc<SecretVault>,
    verifier: Arc<dyn HostKeyVerifier>,
    caps: Arc<CapCache>,
}

impl FirewallService {
    pub fn new(store: Arc<dyn HostStore>, vault: Arc<SecretVault>) -> Self {
        Self {
            store,
            vault,
            verifier: Arc::new(InsecureAcceptAll),
            caps: Arc::new(CapCache::from_config()),
        }
    }

    pub fn with_host_key_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    fn client(&self, host_id: u64) -> Result<SshClient, EngineError> {
        let host = self.store.get(host_id)?.normalized();
        Ok(SshClient::new(host, self.vault.clone())
            .with_host_key_verifier(self.verifier.clone())
            .with_cap_cache(self.caps.clone()))
    }

    // ---- reads ----

    pub async fn list_chains(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
    ) -> Result<Vec<Chain>, EngineError> {
        let cli = self.client(host_id)?;
        let dump = cli.iptables_save(cancel, family).await?;
        let (chains, _) = codec::parse_table(&dump, table);
        Ok(chains)
    }

    pub async fn list_rules(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: &str,
    ) -> Result<Vec<Rule>, EngineError> {
        let cli = self.client(host_id)?;
        let dump = cli.iptables_save(cancel, family).await?;
        let (_, rules) = codec::parse_table(&dump, table);
        Ok(rules.into_iter().filter(|r| r.chain == chain).collect())
    }

    /// The full structured ruleset of a host.
    pub async fn rules_view(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
    ) -> Result<FirewallDump, EngineError> {
        let cli = self.client(host_id)?;
        let dump = cli.iptables_save(cancel, family).await?;
        Ok(codec::decode(&dump))
    }

    // ---- chain management ----

    pub async fn create_chain(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        name: &str,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let args = vec!["-N".to_string(), name.to_string()];
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    /// Delete a chain with `-X`. The chain must already be empty and
    /// unreferenced or the remote side refuses.
    pub async fn delete_chain(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        name: &str,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let args = vec!["-X".to_string(), name.to_string()];
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    pub async fn clear_chain(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        name: &str,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let args = vec!["-F".to_string(), name.to_string()];
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    // ---- rule management ----

    /// Append the rule, or insert at `input.num` when it is positive.
    pub async fn create_rule(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: &str,
        input: &RuleInput,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let args = create_rule_args(chain, input);
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    /// Replace the rule at a position: delete it, then insert the new rule
    /// at the same position.
    ///
    /// Not linearizable against concurrent edits of the same chain; callers
    /// wanting atomicity wrap the sequence in a transaction.
    pub async fn update_rule(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: &str,
        rule_id: &str,
        input: &RuleInput,
    ) -> Result<(), EngineError> {
        let num = parse_rule_num(rule_id)?;
        let cli = self.client(host_id)?;

        let del = vec!["-D".to_string(), chain.to_string(), num.to_string()];
        cli.iptables(cancel, family, table.as_str(), &del).await?;

        let mut replaced = input.clone();
        replaced.num = Some(match input.num {
            Some(n) if n > 0 => n,
            _ => num,
        });
        let args = create_rule_args(chain, &replaced);
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    pub async fn delete_rule(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: &str,
        rule_id: &str,
    ) -> Result<(), EngineError> {
        let num = parse_rule_num(rule_id)?;
        self.delete_num(cancel, host_id, family, table, chain, num)
            .await
    }

    // ---- raw operations ----

    /// Flush a whole table, or one chain of it.
    pub async fn flush(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: Option<&str>,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let mut args = vec!["-F".to_string()];
        if let Some(chain) = chain {
            args.push(chain.to_string());
        }
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    /// Zero the packet counters of a table, or of one chain.
    pub async fn zero(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: Option<&str>,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let mut args = vec!["-Z".to_string()];
        if let Some(chain) = chain {
            args.push(chain.to_string());
        }
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    /// Flush everything, then delete the user-defined chains (`-F`, `-X`).
    pub async fn clear_user_chains(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        cli.iptables(cancel, family, table.as_str(), &["-F".to_string()])
            .await?;
        cli.iptables(cancel, family, table.as_str(), &["-X".to_string()])
            .await?;
        Ok(())
    }

    /// Append a raw rule spec to a chain.
    pub async fn append(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: &str,
        rule: &str,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let args = vec!["-A".to_string(), chain.to_string(), rule.to_string()];
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    /// Insert a raw rule spec at a position.
    pub async fn insert(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: &str,
        pos: u32,
        rule: &str,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let args = vec![
            "-I".to_string(),
            chain.to_string(),
            pos.to_string(),
            rule.to_string(),
        ];
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    /// Delete the rule at a position.
    pub async fn delete_num(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        table: Table,
        chain: &str,
        num: u32,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        let args = vec!["-D".to_string(), chain.to_string(), num.to_string()];
        cli.iptables(cancel, family, table.as_str(), &args).await?;
        Ok(())
    }

    /// Export the ruleset as save text.
    pub async fn export(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
    ) -> Result<String, EngineError> {
        let cli = self.client(host_id)?;
        cli.iptables_save(cancel, family).await
    }

    /// Import save text through the restore tool's stdin.
    pub async fn import(
        &self,
        cancel: &CancellationToken,
        host_id: u64,
        family: IpFamily,
        content: &str,
    ) -> Result<(), EngineError> {
        let cli = self.client(host_id)?;
        cli.iptables_restore(cancel, family, content).await?;
        Ok(())
    }
}

fn create_rule_args(chain: &str, input: &RuleInput) -> Vec<String> {
    let mut args = match input.num {
        Some(num) if num > 0 => vec!["-I".to_string(), chain.to_string(), num.to_string()],
        _ => vec!["-A".to_string(), chain.to_string()],
    };
    args.extend(codec::rule_args(input));
    args
}

/// Accepts a bare position (`"3"`) or a rule id (`"INPUT:3"`).
pub fn parse_rule_num(id: &str) -> Result<u32, EngineError> {
    if let Ok(num) = id.parse::<u32>() {
        return Ok(num);
    }
    if let Some((_, tail)) = id.rsplit_once(':')
        && let Ok(num) = tail.parse::<u32>()
    {
        return Ok(num);
    }
    Err(EngineError::Config(format!("invalid rule id: {id}")))
}
