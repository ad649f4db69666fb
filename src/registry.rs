//! Snapshot registries for providers and users: hot-path reads never block
//! a refresh. A refresh builds the new immutable snapshot off to the side
//! and swaps it in atomically; readers just clone the `Arc`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{debug, warn};

use crate::errors::Error;
use crate::models::{Provider, User};
use crate::stores::{ProviderStore, UserStore};

/// Ordered (by `priority` ascending), `enabled`-filtered snapshot of
/// configured providers.
pub struct ProviderRegistry {
    store: Arc<dyn ProviderStore>,
    node: u32,
    snapshot: ArcSwap<Vec<Provider>>,
}

impl ProviderRegistry {
    pub fn new(store: Arc<dyn ProviderStore>, node: u32) -> Self {
        ProviderRegistry {
            store,
            node,
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Readers only hold the swap long enough to clone the `Arc` — no lock
    /// is ever held across I/O.
    pub fn snapshot(&self) -> Arc<Vec<Provider>> {
        self.snapshot.load_full()
    }

    pub async fn refresh(&self) -> Result<(), Error> {
        let mut providers = self.store.load_enabled(self.node).await?;
        providers.sort_by_key(|p| p.priority);
        debug!("[provider-registry] refreshed: {} enabled", providers.len());
        self.snapshot.store(Arc::new(providers));
        Ok(())
    }
}

/// Snapshot of users keyed by name.
pub struct UserRegistry {
    store: Arc<dyn UserStore>,
    snapshot: ArcSwap<HashMap<String, User>>,
}

impl UserRegistry {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        UserRegistry {
            store,
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<User> {
        self.snapshot.load().get(name).cloned()
    }

    pub async fn refresh(&self) -> Result<(), Error> {
        let users = self.store.load_all().await?;
        let map = users.into_iter().map(|u| (u.name.clone(), u)).collect();
        debug!("[user-registry] refreshed");
        self.snapshot.store(Arc::new(map));
        Ok(())
    }
}

/// Runs `refresh` immediately, then every `period`, forever. A failed
/// refresh is logged and the previous snapshot is kept — a registry never
/// blanks itself out because the store had a hiccup.
pub async fn schedule_refresh(
    provider_registry: Arc<ProviderRegistry>,
    user_registry: Arc<UserRegistry>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if let Err(e) = provider_registry.refresh().await {
            warn!("[registry] provider refresh failed: {}", e);
        }
        if let Err(e) = user_registry.refresh().await {
            warn!("[registry] user refresh failed: {}", e);
        }
    }
}
