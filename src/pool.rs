//! Bounded per-provider connection pool with a factory-based creation hook
//! and a nginx-style circuit breaker.
//!
//! `Pool::get`/`Pool::return_object` hold a single `tokio::sync::Mutex`
//! across the *entire* operation, factory dial included — deliberately, so
//! that concurrent `get()`s on a cold pool don't all dial at once. Each
//! provider gets its own pool (via [`PoolProvider`]), so this never
//! serialises across providers.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::client::{DialConfig, UpstreamClient};
use crate::errors::Error;
use crate::models::Provider;

/// Produces a freshly dialed-and-authenticated client. Implemented by
/// [`ProviderFactory`] in production, and by a stub in tests.
#[async_trait]
pub trait Factory: Send + Sync {
    async fn create(&self) -> Result<UpstreamClient, Error>;
}

/// Dial + Authenticate against one configured [`Provider`].
pub struct ProviderFactory {
    provider: Provider,
}

impl ProviderFactory {
    pub fn new(provider: Provider) -> Self {
        ProviderFactory { provider }
    }
}

#[async_trait]
impl Factory for ProviderFactory {
    async fn create(&self) -> Result<UpstreamClient, Error> {
        let cfg = DialConfig {
            connect_timeout: Duration::from_millis(self.provider.connect_timeout_ms),
            use_tls: self.provider.use_tls,
        };
        let mut client =
            UpstreamClient::dial(&self.provider.host, self.provider.port, &cfg).await?;
        client
            .authenticate(&self.provider.user, &self.provider.pass)
            .await?;
        Ok(client)
    }
}

struct PooledClient {
    client: UpstreamClient,
    token: u64,
}

struct PoolState {
    idle: VecDeque<PooledClient>,
    active: HashSet<u64>,
    fails: u16,
    last_check: Option<Instant>,
    next_token: u64,
}

/// A client leased out of a [`Pool`]. Callers use `client_mut()` to issue
/// commands, call `invalidate()` the moment they observe a network error or
/// a 400-class close, then must hand it back via `Pool::return_object` —
/// exactly one `Return` per successful `Get`.
pub struct Leased {
    client: Option<UpstreamClient>,
    token: u64,
    valid: bool,
}

impl Leased {
    pub fn client_mut(&mut self) -> &mut UpstreamClient {
        self.client.as_mut().expect("leased client taken twice")
    }

    /// Marks this object invalid; monotonic — the pool never un-invalidates
    /// an object on the caller's behalf.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Bounded idle/active set of [`UpstreamClient`]s for one provider.
pub struct Pool {
    factory: Arc<dyn Factory>,
    state: Mutex<PoolState>,
    capacity: usize,
    max_fails: u16,
    fail_timeout: Duration,
}

impl Pool {
    pub fn new(factory: Arc<dyn Factory>, capacity: usize, max_fails: u16, fail_timeout: Duration) -> Self {
        Pool {
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(capacity),
                active: HashSet::with_capacity(capacity),
                fails: 0,
                last_check: None,
                next_token: 0,
            }),
            capacity,
            max_fails,
            fail_timeout,
        }
    }

    pub async fn get(&self) -> Result<Leased, Error> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(pooled) = state.idle.pop_front() {
            state.active.insert(pooled.token);
            return Ok(Leased {
                client: Some(pooled.client),
                token: pooled.token,
                valid: true,
            });
        }

        if state.active.len() == self.capacity {
            return Err(Error::PoolBusy);
        }

        if self.max_fails > 0
            && state.fails >= self.max_fails
            && state
                .last_check
                .map(|last| now.duration_since(last) <= self.fail_timeout)
                .unwrap_or(false)
        {
            return Err(Error::PoolDisabled);
        }

        state.last_check = Some(now);

        match self.factory.create().await {
            Ok(client) => {
                state.fails = 0;
                let token = state.next_token;
                state.next_token += 1;
                state.active.insert(token);
                Ok(Leased {
                    client: Some(client),
                    token,
                    valid: true,
                })
            }
            Err(e) => {
                state.fails += 1;
                if self.max_fails > 0 && state.fails >= self.max_fails {
                    Err(Error::PoolDisabled)
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn return_object(&self, mut leased: Leased) {
        let mut state = self.state.lock().await;
        state.active.remove(&leased.token);

        let client = leased.client.take();
        if leased.valid {
            if let Some(client) = client {
                state.idle.push_back(PooledClient {
                    client,
                    token: leased.token,
                });
            }
        } else if let Some(client) = client {
            client.close().await;
        }
    }

    #[cfg(test)]
    pub async fn idle_len(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    #[cfg(test)]
    pub async fn active_len(&self) -> usize {
        self.state.lock().await.active.len()
    }
}

/// Lazily creates and caches one [`Pool`] per provider name.
pub struct PoolProvider {
    pools: SyncMutex<HashMap<String, Arc<Pool>>>,
}

impl PoolProvider {
    pub fn new() -> Self {
        PoolProvider {
            pools: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn get_pool(&self, provider: &Provider) -> Arc<Pool> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&provider.name) {
            return pool.clone();
        }
        let factory = Arc::new(ProviderFactory::new(provider.clone()));
        let pool = Arc::new(Pool::new(
            factory,
            provider.max_conns as usize,
            provider.max_fails,
            Duration::from_secs(provider.fail_timeout),
        ));
        pools.insert(provider.name.clone(), pool.clone());
        pool
    }
}

impl Default for PoolProvider {
    fn default() -> Self {
        Self::new()
    }
}
