//! Classification of sudo stderr output.
//!
//! The elevation ladder decides its next step by matching the stderr of a
//! failed `sudo` invocation against three lexicons, case-insensitively:
//!
//! 1. **need-password**: sudo wants a password on stdin (`sudo -S`).
//! 2. **require-TTY**: the sudoers policy demands a terminal (`requiretty`).
//! 3. **read-from-TTY**: sudo tried to read the password from /dev/tty and
//!    there was none, so the retry must allocate a PTY.
//!
//! The CJK entries cover hosts with zh_CN locales, where sudo localizes its
//! prompts.

/// Patterns meaning sudo wants a password.
const NEED_PASSWORD_PATTERNS: &[&str] = &[
    "需要密码",
    "password is required",
    "a password is required",
    "sudo: a password is required",
    "password:",
    "sudo: password for",
    "authentication failure",
];

/// Patterns meaning the sudoers policy requires a terminal.
const REQUIRE_TTY_PATTERNS: &[&str] = &[
    "no tty",
    "a terminal is required",
    "you must have a tty",
    "requiretty",
    "需要 tty",
];

/// Patterns meaning sudo failed to read its password from a terminal.
const READ_FROM_TTY_PATTERNS: &[&str] = &["not a tty", "no tty present", "unable to allocate pty"];

/// True if the stderr of a failed sudo run asks for a password.
///
/// Besides the fixed patterns, any stderr that carries a `sudo:` prefix
/// together with "password" or "需要" counts; sudo's wording varies across
/// versions and locales.
pub(crate) fn needs_sudo_password(stderr: &str) -> bool {
    let s = stderr.trim().to_lowercase();
    if s.is_empty() {
        return false;
    }
    if NEED_PASSWORD_PATTERNS.iter().any(|p| s.contains(p)) {
        return true;
    }
    s.contains("sudo:") && (s.contains("password") || s.contains("需要"))
}

/// True if stderr indicates the sudoers policy requires a TTY.
pub(crate) fn looks_like_require_tty(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    REQUIRE_TTY_PATTERNS.iter().any(|p| s.contains(p))
}

/// True if stderr indicates sudo could not read its password from a TTY.
pub(crate) fn looks_like_read_from_tty(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    READ_FROM_TTY_PATTERNS.iter().any(|p| s.contains(p))
}
