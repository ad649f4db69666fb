//! Immutable views of the accounts and upstream providers the rest of the
//! crate operates on. Instances are produced wholesale by a store refresh
//! (see [`crate::stores`]) and never mutated in place — a changed row means a
//! new `User`/`Provider` value in the next snapshot.

use serde::{Deserialize, Serialize};

/// One account allowed to authenticate against this front-end.
///
/// `password_hash` is the lowercase hex encoding of `sha256(password)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub password_hash: String,
    pub max_conns: u16,
    pub ip_sharing: bool,
    /// Inert byte counter updated via [`crate::metrics::Metrics::add_user_bytes`].
    /// Never persisted — persistence is out of scope.
    #[serde(default)]
    pub rx_bytes: u64,
}

impl User {
    pub fn name_is_valid(name: &str) -> bool {
        !name.is_empty() && name.len() <= 32
    }
}

/// One upstream news server this front-end can fail over to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub use_tls: bool,
    pub priority: u16,
    pub max_conns: u16,
    pub max_fails: u16,
    pub fail_timeout: u64,
    pub connect_timeout_ms: u64,
    pub enabled: bool,
    /// Informational; article caching (and thus retention-aware routing) is
    /// a non-goal, so the core never reads this.
    #[serde(default)]
    pub retention_days: u16,
}

impl Provider {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
