//! Read-only access to account and provider rows, backed by whatever
//! relational store an operator points it at. This crate only ever reads
//! from them.
//!
//! `StaticStore` is the default/test implementation: a fixed, in-memory
//! snapshot. A real deployment swaps in a store backed by whatever the
//! operator's database is; the registries (`crate::registry`) don't care
//! which.

use async_trait::async_trait;

use crate::errors::Error;
use crate::models::{Provider, User};

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<User>, Error>;
}

#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// `node` is the external-store selector; callers source it from
    /// [`crate::config::Config`] instead.
    async fn load_enabled(&self, node: u32) -> Result<Vec<Provider>, Error>;
}

/// Fixed in-memory snapshot, used by tests and as a drop-in default for a
/// single-node deployment with no external store wired up.
pub struct StaticStore {
    users: Vec<User>,
    providers: Vec<Provider>,
}

impl StaticStore {
    pub fn new(users: Vec<User>, providers: Vec<Provider>) -> Self {
        StaticStore { users, providers }
    }
}

#[async_trait]
impl UserStore for StaticStore {
    async fn load_all(&self) -> Result<Vec<User>, Error> {
        Ok(self.users.clone())
    }
}

#[async_trait]
impl ProviderStore for StaticStore {
    async fn load_enabled(&self, _node: u32) -> Result<Vec<Provider>, Error> {
        Ok(self.providers.iter().filter(|p| p.enabled).cloned().collect())
    }
}
