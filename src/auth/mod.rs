//! Authentication: pluggable authenticators and the ordered chain.
//!
//! An [`Authenticator`] inspects a host descriptor and either produces an
//! [`AuthAttempt`] (a login user plus the SSH auth methods to try) or
//! declines. The connection manager walks the [`AuthChain`] in order and
//! dials once per attempt, stopping at the first authenticated connection.

mod chain;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuthenticator;
pub use password::PasswordAuthenticator;
pub use traits::{AuthAttempt, AuthMethod, Authenticator};
