//! Privilege elevation strategies.
//!
//! The login profile of a host decides how a command gains root:
//!
//! - **root**: the session already is root, run the command as-is.
//! - **sudo**: the fallback ladder below.
//! - **user-su**: wrap in `su - <root> -c "..."` on a PTY and feed the root
//!   password on stdin.
//!
//! # The sudo ladder
//!
//! 1. `sudo -n <cmd>`. On success, done. If the failure stderr matches none
//!    of the known lexicons, it is a real failure and is returned.
//! 2. If the capability probe said passwordless sudo works and the failure
//!    was not a password prompt, the failure is also real.
//! 3. `sudo -S -p '' <cmd>` with the password appended to stdin. A PTY is
//!    allocated up front when the command asked for one, the probe found a
//!    requiretty policy, or step 1's stderr demanded a terminal.
//! 4. If step 3 ran without a PTY and still failed asking for one, it is
//!    repeated once with a PTY.
//!
//! Each strategy stamps the result with its name.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{ExecResult, SshClient};
use crate::command::{Command, double_quote_escape, path_wrap};
use crate::error::short_for_log;
use crate::host::{HostDescriptor, LoginProfile, first_non_empty};
use crate::sudo::{looks_like_read_from_tty, looks_like_require_tty, needs_sudo_password};

/// Closed set of elevation strategies, selected from the login profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeStrategy {
    Root,
    Sudo,
    UserSu,
}

impl PrivilegeStrategy {
    pub fn for_host(host: &HostDescriptor) -> Self {
        match host.profile {
            LoginProfile::Root => PrivilegeStrategy::Root,
            LoginProfile::Sudo => PrivilegeStrategy::Sudo,
            LoginProfile::User => PrivilegeStrategy::UserSu,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrivilegeStrategy::Root => "root",
            PrivilegeStrategy::Sudo => "sudo",
            PrivilegeStrategy::UserSu => "user-su",
        }
    }

    pub(crate) async fn exec(
        &self,
        client: &SshClient,
        cmd: &Command,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ExecResult {
        match self {
            PrivilegeStrategy::Root => client.raw_run(cmd, deadline, cancel).await,
            PrivilegeStrategy::Sudo => sudo_exec(client, cmd, deadline, cancel).await,
            PrivilegeStrategy::UserSu => {
                let wrapped = user_su_command(client.host(), cmd, &client.root_password());
                client.raw_run(&wrapped, deadline, cancel).await
            }
        }
    }
}

async fn sudo_exec(
    client: &SshClient,
    cmd: &Command,
    deadline: Instant,
    cancel: &CancellationToken,
) -> ExecResult {
    let caps = client.probe_capabilities(cancel).await;

    // 1) sudo -n
    let mut c1 = cmd.clone();
    c1.raw = format!("sudo -n {}", cmd.resolved_raw());
    c1.args.clear();
    let r1 = client.raw_run(&c1, deadline, cancel).await;
    if r1.ok() {
        return r1;
    }
    if r1.error.as_ref().is_some_and(|e| e.is_interrupted()) {
        return r1;
    }

    let need_pass = needs_sudo_password(&r1.stderr);
    let require_tty = looks_like_require_tty(&r1.stderr);
    let read_from_tty = looks_like_read_from_tty(&r1.stderr);

    // 2) a failure that is not a password prompt while the probe said
    //    NOPASSWD works is some other class of failure
    if caps.sudo_no_pass && !need_pass {
        return r1;
    }
    if !need_pass && !require_tty && !read_from_tty {
        return r1;
    }
    debug!(
        host = %r1.host,
        stderr = %short_for_log(&r1.stderr),
        "sudo -n refused, retrying with password"
    );

    // 3) sudo -S with the password on stdin
    let password = client.user_password();
    let mut c2 = cmd.clone();
    c2.raw = format!("sudo -S -p '' {}", cmd.resolved_raw());
    c2.args.clear();
    c2.stdin = if cmd.stdin.is_empty() {
        format!("{password}\n")
    } else {
        format!("{}\n{password}\n", cmd.stdin)
    };
    c2.pty = cmd.pty || caps.require_tty || require_tty || read_from_tty;

    let r2 = client.raw_run(&c2, deadline, cancel).await;
    if r2.ok() || c2.pty {
        return r2;
    }
    if r2.error.as_ref().is_some_and(|e| e.is_interrupted()) {
        return r2;
    }

    // 4) sudo insisted on a terminal, repeat once with a PTY
    if looks_like_require_tty(&r2.stderr) || looks_like_read_from_tty(&r2.stderr) {
        debug!(host = %r2.host, "sudo -S wants a terminal, retrying with pty");
        let mut c3 = c2;
        c3.pty = true;
        return client.raw_run(&c3, deadline, cancel).await;
    }
    r2
}

/// Build the `su - <root> -c "..."` wrapper for the user profile.
///
/// The inner command is path-wrapped here (when the caller asked for a
/// shell), so the outer command must not be wrapped again.
fn user_su_command(host: &HostDescriptor, cmd: &Command, root_password: &str) -> Command {
    let root_user = first_non_empty(&host.root_user, "root").to_string();
    let mut raw = cmd.resolved_raw();
    if cmd.shell {
        raw = path_wrap(&raw);
    }

    let mut wrapped = cmd.clone();
    wrapped.raw = format!(r#"su - {root_user} -c "{}""#, double_quote_escape(&raw));
    wrapped.args.clear();
    wrapped.shell = false;
    // su prompts on the terminal
    wrapped.pty = true;
    wrapped.stdin = if cmd.stdin.is_empty() {
        format!("{root_password}\n")
    } else {
        format!("{}\n{root_password}\n", cmd.stdin)
    };
    wrapped
}
