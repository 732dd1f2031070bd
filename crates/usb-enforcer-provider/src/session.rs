//! Provider contract for login-session introspection.

use std::error::Error;

/// Answers which OS groups the currently active local users belong to.
pub trait SessionProbe {
    type Error: Error + Send + Sync + 'static;

    /// Union of group names for every active login session.
    fn active_user_groups(&self) -> Result<Vec<String>, Self::Error>;
}
