//! Engine error kinds.
//!
//! Every failure in the engine maps onto one closed set of kinds so callers
//! (and per-host batch results) can branch on the class of failure without
//! matching message strings:
//!
//! - `Config`: missing or malformed keys, host fields, rule ids. Fatal at
//!   init for keys, a caller error otherwise.
//! - `Dial`: TCP connect or SSH handshake failure. Never retried here.
//! - `Auth`: every authenticator in the chain declined or was rejected;
//!   carries the last underlying cause.
//! - `Transport`: session creation or I/O failure mid-command.
//! - `Timeout` / `Canceled`: the session was killed; exit code becomes -1.
//! - `Remote`: the remote process exited non-zero; carries the exit status
//!   and a stderr tail. The full stderr stays on the execution result.
//! - `Parse`: malformed structured input. The ruleset decoder itself never
//!   produces this; unknown rule options are preserved verbatim instead.
//! - `Crypto`: AEAD seal/open failure on a credential blob.

use thiserror::Error;

/// Number of trailing stderr characters carried in error messages.
///
/// The full stderr always remains available on the execution result; the
/// tail exists so error strings stay loggable.
pub(crate) const STDERR_TAIL_CHARS: usize = 200;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Missing or malformed configuration: master key, host fields, rule ids.
    #[error("config: {0}")]
    Config(String),

    /// TCP connect or SSH handshake failure.
    #[error("dial: {0}")]
    Dial(String),

    /// All authenticators in the chain declined or were rejected.
    #[error("auth: {0}")]
    Auth(String),

    /// Session creation or I/O failure while a command was in flight.
    #[error("transport: {0}")]
    Transport(String),

    /// The command outlived its effective timeout and was killed.
    #[error("command timed out")]
    Timeout,

    /// The caller canceled the operation.
    #[error("operation canceled")]
    Canceled,

    /// The remote process exited non-zero.
    #[error("remote exit {code}: {stderr_tail}")]
    Remote { code: i32, stderr_tail: String },

    /// Malformed structured input from a caller.
    #[error("parse: {0}")]
    Parse(String),

    /// AEAD seal or open failed on a credential blob.
    #[error("crypto: {0}")]
    Crypto(String),
}

impl EngineError {
    /// Stable short name of the kind, for logs and result rows.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Dial(_) => "dial",
            EngineError::Auth(_) => "auth",
            EngineError::Transport(_) => "transport",
            EngineError::Timeout => "timeout",
            EngineError::Canceled => "canceled",
            EngineError::Remote { .. } => "remote",
            EngineError::Parse(_) => "parse",
            EngineError::Crypto(_) => "crypto",
        }
    }

    /// True for the two kinds produced by killing the session early.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, EngineError::Timeout | EngineError::Canceled)
    }
}

/// Last [`STDERR_TAIL_CHARS`] characters of `s`, trimmed.
///
/// Operates on characters rather than bytes; sudo stderr can be CJK and a
/// byte slice could land mid-codepoint.
pub(crate) fn stderr_tail(s: &str) -> String {
    let count = s.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return s.trim().to_string();
    }
    s.chars()
        .skip(count - STDERR_TAIL_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

/// First 200 characters of `s`, for command-line logging.
pub(crate) fn short_for_log(s: &str) -> String {
    if s.chars().count() <= 200 {
        return s.to_string();
    }
    let mut out: String = s.chars().take(200).collect();
    out.push_str("...(truncated)");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    mod kinds {
        use super::*;

        #[test]
        fn test_kind_names_are_stable() {
            assert_eq!(EngineError::Config("x".into()).kind(), "config");
            assert_eq!(EngineError::Dial("x".into()).kind(), "dial");
            assert_eq!(EngineError::Auth("x".into()).kind(), "auth");
            assert_eq!(EngineError::Transport("x".into()).kind(), "transport");
            assert_eq!(EngineError::Timeout.kind(), "timeout");
            assert_eq!(EngineError::Canceled.kind(), "canceled");
            assert_eq!(
                EngineError::Remote {
                    code: 2,
                    stderr_tail: String::new()
                }
                .kind(),
                "remote"
            );
            assert_eq!(EngineError::Parse("x".into()).kind(), "parse");
            assert_eq!(EngineError::Crypto("x".into()).kind(), "crypto");
        }

        #[test]
        fn test_remote_display_carries_code_and_tail() {
            let err = EngineError::Remote {
                code: 4,
                stderr_tail: "iptables: No chain by that name".into(),
            };
            let msg = err.to_string();
            assert!(msg.contains("exit 4"));
            assert!(msg.contains("No chain by that name"));
        }

        #[test]
        fn test_is_interrupted() {
            assert!(EngineError::Timeout.is_interrupted());
            assert!(EngineError::Canceled.is_interrupted());
            assert!(!EngineError::Dial("x".into()).is_interrupted());
        }
    }

    mod truncation {
        use super::*;

        #[test]
        fn test_short_stderr_is_kept_whole() {
            assert_eq!(stderr_tail("  permission denied \n"), "permission denied");
        }

        #[test]
        fn test_long_stderr_keeps_the_tail() {
            let long = format!("{}END", "x".repeat(500));
            let tail = stderr_tail(&long);
            assert!(tail.ends_with("END"));
            assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
        }

        #[test]
        fn test_tail_respects_char_boundaries() {
            let long = "密".repeat(300);
            let tail = stderr_tail(&long);
            assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
            assert!(tail.chars().all(|c| c == '密'));
        }

        #[test]
        fn test_short_for_log_truncates() {
            let long = "a".repeat(300);
            let out = short_for_log(&long);
            assert!(out.ends_with("...(truncated)"));
            assert_eq!(short_for_log("ls"), "ls");
        }
    }
}
