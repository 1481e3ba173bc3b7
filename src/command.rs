//! Command construction and shell wrapping.
//!
//! A [`Command`] carries everything needed to run one remote process: the
//! raw command line (or argv), optional stdin, PTY/shell flags, a timeout,
//! an environment map and a working directory. Options chain fluently:
//!
//! ```ignore
//! let cmd = Command::new("iptables-save")
//!     .with_shell(true)
//!     .with_timeout(Duration::from_secs(5));
//! ```
//!
//! Wrapping happens at execution time, in a fixed order: shell PATH prefix,
//! then `cd <workdir> &&`, then sorted `K=v` environment pairs. Sorting the
//! environment keys keeps the final command line deterministic, which
//! matters for audit logs and result hooks.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One remote command and how to run it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    /// Raw command line. When empty, `args` joined by spaces take its place.
    pub raw: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Data written to the remote stdin before reading output.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdin: String,
    /// Allocate a PTY for the session.
    #[serde(default)]
    pub pty: bool,
    /// Run through a login shell with the sbin PATH prefix.
    #[serde(default)]
    pub shell: bool,
    /// Per-command timeout; `None` or zero falls back to the client default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workdir: String,
}

impl Command {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Self::default()
        }
    }

    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    pub fn with_shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = dir.into();
        self
    }

    /// The command line to wrap: `raw`, or the joined argv when `raw` is empty.
    pub(crate) fn resolved_raw(&self) -> String {
        if self.raw.is_empty() && !self.args.is_empty() {
            return self.args.join(" ");
        }
        self.raw.clone()
    }

    /// The fully wrapped command line sent to the remote side.
    pub(crate) fn wrapped(&self) -> String {
        let mut run = self.resolved_raw();
        if self.shell {
            run = path_wrap(&run);
        }
        if !self.workdir.is_empty() {
            run = format!("cd {} && {}", shell_escape(&self.workdir), run);
        }
        if !self.env.is_empty() {
            run = env_wrap(&self.env, &run);
        }
        run
    }
}

/// Run a command under a login shell with the sbin directories prepended.
///
/// Minimal login shells for unprivileged users frequently lack /usr/sbin in
/// PATH, which is where iptables and friends live.
pub(crate) fn path_wrap(cmd: &str) -> String {
    format!("sh -lc 'PATH=/usr/sbin:/sbin:/usr/local/sbin:$PATH; {cmd}'")
}

/// Prepend `K=v` pairs in sorted key order.
pub(crate) fn env_wrap(env: &BTreeMap<String, String>, cmd: &str) -> String {
    let pairs: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("{k}={}", shell_escape(v)))
        .collect();
    format!("{} {cmd}", pairs.join(" "))
}

/// Single-quote escaping: `'` becomes `'"'"'`.
pub(crate) fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Escape for interpolation inside a double-quoted shell string.
pub(crate) fn double_quote_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    mod building {
        use super::*;

        #[test]
        fn test_new_sets_raw_only() {
            let cmd = Command::new("uptime");
            assert_eq!(cmd.raw, "uptime");
            assert!(!cmd.pty);
            assert!(!cmd.shell);
            assert!(cmd.stdin.is_empty());
            assert!(cmd.timeout.is_none());
        }

        #[test]
        fn test_args_join_when_raw_is_empty() {
            let cmd = Command::from_args(["iptables", "-t", "nat", "-L"]);
            assert_eq!(cmd.resolved_raw(), "iptables -t nat -L");
        }

        #[test]
        fn test_raw_wins_over_args() {
            let mut cmd = Command::new("echo hi");
            cmd.args = vec!["ignored".into()];
            assert_eq!(cmd.resolved_raw(), "echo hi");
        }

        #[test]
        fn test_fluent_options_compose() {
            let cmd = Command::new("cat")
                .with_stdin("line\n")
                .with_pty(true)
                .with_shell(true)
                .with_timeout(Duration::from_secs(9))
                .with_env("LANG", "C")
                .with_workdir("/tmp");
            assert_eq!(cmd.stdin, "line\n");
            assert!(cmd.pty);
            assert!(cmd.shell);
            assert_eq!(cmd.timeout, Some(Duration::from_secs(9)));
            assert_eq!(cmd.env.get("LANG").map(String::as_str), Some("C"));
            assert_eq!(cmd.workdir, "/tmp");
        }
    }

    mod wrapping {
        use super::*;

        #[test]
        fn test_plain_command_is_untouched() {
            assert_eq!(Command::new("uptime").wrapped(), "uptime");
        }

        #[test]
        fn test_shell_wrap_prefixes_sbin_path() {
            let wrapped = Command::new("iptables-save").with_shell(true).wrapped();
            assert_eq!(
                wrapped,
                "sh -lc 'PATH=/usr/sbin:/sbin:/usr/local/sbin:$PATH; iptables-save'"
            );
        }

        #[test]
        fn test_workdir_prepends_cd() {
            let wrapped = Command::new("ls").with_workdir("/var/log").wrapped();
            assert_eq!(wrapped, "cd '/var/log' && ls");
        }

        #[test]
        fn test_env_pairs_are_sorted_by_key() {
            let wrapped = Command::new("env")
                .with_env("ZED", "1")
                .with_env("ALPHA", "2")
                .with_env("MID", "3")
                .wrapped();
            assert_eq!(wrapped, "ALPHA='2' MID='3' ZED='1' env");
        }

        #[test]
        fn test_wrap_order_env_outside_workdir_outside_shell() {
            let wrapped = Command::new("make")
                .with_shell(true)
                .with_workdir("/src")
                .with_env("V", "1")
                .wrapped();
            assert!(wrapped.starts_with("V='1' cd '/src' && sh -lc "));
        }
    }

    mod escaping {
        use super::*;

        #[test]
        fn test_shell_escape_plain() {
            assert_eq!(shell_escape("/var/log"), "'/var/log'");
        }

        #[test]
        fn test_shell_escape_embedded_quote() {
            assert_eq!(shell_escape("it's"), r#"'it'"'"'s'"#);
        }

        #[test]
        fn test_double_quote_escape() {
            assert_eq!(
                double_quote_escape(r#"echo "$HOME" `id`"#),
                r#"echo \"\$HOME\" \`id\`"#
            );
            assert_eq!(double_quote_escape(r"a\b"), r"a\\b");
        }
    }
}
