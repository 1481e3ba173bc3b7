//! Snapshot-and-restore transactions over a host's ruleset.
//!
//! A transaction snapshots the full dump at `begin`, runs mutations through
//! the normal pipeline, and restores the snapshot if one fails. Restoration
//! is the save/restore roundtrip; there are no partial-rollback semantics
//! and no transactions across hosts. Per host, per family, one-shot.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::{ExecResult, SshClient};
use crate::command::Command;
use crate::error::EngineError;
use crate::iptables::IpFamily;

/// An active snapshot of one host's ruleset.
pub struct FirewallTxn<'a> {
    client: &'a SshClient,
    family: IpFamily,
    backup: String,
    active: bool,
}

impl SshClient {
    /// Snapshot the ruleset and open a transaction over it.
    pub async fn begin_firewall_txn(
        &self,
        cancel: &CancellationToken,
        family: IpFamily,
    ) -> Result<FirewallTxn<'_>, EngineError> {
        let backup = self.iptables_save(cancel, family).await?;
        Ok(FirewallTxn {
            client: self,
            family,
            backup,
            active: true,
        })
    }
}

impl FirewallTxn<'_> {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The dump captured at `begin`.
    pub fn snapshot(&self) -> &str {
        &self.backup
    }

    /// Run a command; on failure restore the snapshot and return the
    /// command's original error.
    pub async fn exec_in_txn(
        &mut self,
        cancel: &CancellationToken,
        cmd: Command,
    ) -> Result<ExecResult, EngineError> {
        if !self.active {
            return Err(EngineError::Config("transaction is not active".into()));
        }
        let res = self.client.exec(cancel, cmd).await;
        if let Some(err) = res.error.clone() {
            if let Err(restore_err) = self.rollback(cancel).await {
                warn!(host = %res.host, error = %restore_err, "rollback after failed mutation also failed");
            }
            return Err(err);
        }
        Ok(res)
    }

    /// Release the snapshot; the mutations stand.
    pub fn commit(&mut self) {
        self.active = false;
    }

    /// Restore the snapshot explicitly. A finished transaction is a no-op.
    pub async fn rollback(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.client
            .iptables_restore(cancel, self.family, &self.backup)
            .await?;
        Ok(())
    }
}
