//! iptables transport: running the tooling over SSH.
//!
//! Binary paths default to the /usr/sbin variants; the capability probe can
//! override the iptables path, and the v6 toolchain is derived by the
//! `iptables` to `ip6tables` substitution.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::SshClient;
use crate::command::Command;
use crate::error::{EngineError, stderr_tail};

use super::IpFamily;

const SAVE_BIN: &str = "/usr/sbin/iptables-save";
const RESTORE_BIN: &str = "/usr/sbin/iptables-restore";

fn v6_variant(bin: &str) -> String {
    bin.replace("iptables", "ip6tables")
}

impl SshClient {
    /// Dump the full ruleset with `iptables-save` / `ip6tables-save`.
    pub async fn iptables_save(
        &self,
        cancel: &CancellationToken,
        family: IpFamily,
    ) -> Result<String, EngineError> {
        let bin = if family.is_v6() {
            v6_variant(SAVE_BIN)
        } else {
            SAVE_BIN.to_string()
        };
        let res = self.exec(cancel, Command::new(&bin).with_shell(true)).await;
        match res.error {
            Some(err) => {
                warn!(host = %res.host, cmd = %bin, error = %err, stderr = %stderr_tail(&res.stderr), "save failed");
                Err(err)
            }
            None => Ok(res.stdout),
        }
    }

    /// Run one iptables invocation against a table.
    ///
    /// The binary comes from the capability probe (so distributions with
    /// iptables outside /usr/sbin still work) and the args are appended
    /// after `-t <table>`.
    pub async fn iptables(
        &self,
        cancel: &CancellationToken,
        family: IpFamily,
        table: &str,
        args: &[String],
    ) -> Result<String, EngineError> {
        let caps = self.probe_capabilities(cancel).await;
        let bin = if family.is_v6() {
            v6_variant(&caps.iptables_path)
        } else {
            caps.iptables_path
        };
        let full = format!("{bin} -t {table} {}", args.join(" "));
        let res = self.exec(cancel, Command::new(&full).with_shell(true)).await;
        match res.error {
            Some(err) => {
                warn!(host = %res.host, cmd = %full, error = %err, stderr = %stderr_tail(&res.stderr), "iptables failed");
                Err(err)
            }
            None => Ok(res.stdout),
        }
    }

    /// Replace the ruleset by feeding `content` to `iptables-restore` on stdin.
    pub async fn iptables_restore(
        &self,
        cancel: &CancellationToken,
        family: IpFamily,
        content: &str,
    ) -> Result<String, EngineError> {
        let bin = if family.is_v6() {
            v6_variant(RESTORE_BIN)
        } else {
            RESTORE_BIN.to_string()
        };
        let res = self
            .exec(
                cancel,
                Command::new(&bin).with_shell(true).with_stdin(content),
            )
            .await;
        match res.error {
            Some(err) => {
                warn!(host = %res.host, cmd = %bin, error = %err, stderr = %stderr_tail(&res.stderr), "restore failed");
                Err(err)
            }
            None => Ok(res.stdout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v6_binary_substitution() {
        assert_eq!(v6_variant("/usr/sbin/iptables-save"), "/usr/sbin/ip6tables-save");
        assert_eq!(v6_variant("/usr/sbin/iptables-restore"), "/usr/sbin/ip6tables-restore");
        assert_eq!(v6_variant("/sbin/iptables"), "/sbin/ip6tables");
    }
}
