//! Failover dispatcher: walks the provider snapshot in priority order,
//! leasing a connection from each provider's pool in turn until one of them
//! actually returns the article.

use std::sync::Arc;

use log::debug;

use crate::codec::MimeHeader;
use crate::errors::Error;
use crate::metrics::Metrics;
use crate::pool::PoolProvider;
use crate::registry::ProviderRegistry;

/// Which upstream command to issue for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Article,
    Body,
}

/// Per-request routing filter: `(message_id, provider_name) -> skip?`. A
/// filter that returns `true` tells the dispatcher not to even attempt that
/// provider for this message id — e.g. to keep a provider's known-missing
/// retention window out of the rotation.
pub type RouteFilter = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    pools: Arc<PoolProvider>,
    metrics: Arc<Metrics>,
    filter: Option<RouteFilter>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ProviderRegistry>, pools: Arc<PoolProvider>, metrics: Arc<Metrics>) -> Self {
        Dispatcher {
            registry,
            pools,
            metrics,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: RouteFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Runs `verb` against `message_id`, trying each enabled provider in
    /// priority order until one succeeds. Every lease is returned to its
    /// pool before moving on, win or lose; a 400-class protocol response
    /// invalidates the connection first.
    pub async fn dispatch(&self, message_id: &str, verb: Verb) -> Result<(MimeHeader, Vec<u8>), Error> {
        self.metrics.inc_article_request();

        let providers = self.registry.snapshot();
        if providers.is_empty() {
            return Err(Error::BackendEmpty);
        }

        for provider in providers.iter() {
            if let Some(filter) = &self.filter {
                if filter(message_id, &provider.name) {
                    continue;
                }
            }

            let pool = self.pools.get_pool(provider);
            let mut leased = match pool.get().await {
                Ok(leased) => leased,
                Err(e) => {
                    debug!("[dispatch] {} unavailable: {}", provider.name, e);
                    continue;
                }
            };

            let result = match verb {
                Verb::Article => leased.client_mut().article(message_id).await,
                Verb::Body => leased.client_mut().body(message_id).await,
            };

            match result {
                Ok((headers, body)) => {
                    self.metrics.inc_backend_request(&provider.name, "220");
                    self.metrics.add_backend_bytes(&provider.name, body.len() as u64);
                    pool.return_object(leased).await;
                    return Ok((headers, body));
                }
                Err(Error::BodyRead(inner)) => {
                    debug!("[dispatch] {} body read failed: {}", provider.name, inner);
                    self.metrics.inc_backend_request(&provider.name, "0");
                    // The status line matched but the drain after it didn't
                    // finish cleanly — the connection's framing state is
                    // unknown, so it's invalidated regardless of what kind
                    // of error the drain itself produced.
                    leased.invalidate();
                    pool.return_object(leased).await;
                }
                Err(Error::Protocol { code, msg }) => {
                    debug!("[dispatch] {} said {} {}", provider.name, code, msg);
                    self.metrics.inc_backend_request(&provider.name, &code.to_string());
                    if code == 400 {
                        leased.invalidate();
                    }
                    pool.return_object(leased).await;
                }
                Err(e) => {
                    debug!("[dispatch] {} failed: {}", provider.name, e);
                    self.metrics.inc_backend_request(&provider.name, "0");
                    leased.invalidate();
                    pool.return_object(leased).await;
                }
            }
        }

        Err(Error::NotFoundEverywhere)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;
    use crate::stores::StaticStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn provider(name: &str, priority: u16, host: String, port: u16) -> Provider {
        Provider {
            name: name.to_string(),
            host,
            port,
            user: String::new(),
            pass: String::new(),
            use_tls: false,
            priority,
            max_conns: 2,
            max_fails: 3,
            fail_timeout: 10,
            connect_timeout_ms: 500,
            enabled: true,
            retention_days: 0,
        }
    }

    /// Binds an ephemeral listener that greets, fails `AUTHINFO`, then
    /// responds with `430` to every `ARTICLE`/`BODY` — standing in for a
    /// provider that genuinely doesn't carry the requested message id.
    async fn spawn_miss_server() -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let _ = sock.write_all(b"200 ok\r\n").await;
                    let _ = sock.write_all(b"381 more\r\n").await;
                    let _ = sock.write_all(b"281 authenticated\r\n").await;
                    let _ = sock.write_all(b"430 no such article\r\n").await;
                });
            }
        });
        (addr.ip().to_string(), addr.port())
    }

    /// Binds an ephemeral listener that greets, authenticates, and returns a
    /// fixed article for every `ARTICLE`/`BODY`.
    async fn spawn_hit_server() -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let _ = sock.write_all(b"200 ok\r\n").await;
                    let _ = sock.write_all(b"381 more\r\n").await;
                    let _ = sock.write_all(b"281 authenticated\r\n").await;
                    let _ = sock
                        .write_all(b"220 0 <id> article\r\nSubject: hi\r\n\r\nbody line\r\n.\r\n")
                        .await;
                });
            }
        });
        (addr.ip().to_string(), addr.port())
    }

    /// Binds an ephemeral listener that greets, authenticates, answers `220`
    /// and then closes the socket before sending any header/body/terminator
    /// — a provider that dies mid-drain after a successful status line.
    async fn spawn_truncated_server() -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let _ = sock.write_all(b"200 ok\r\n").await;
                    let _ = sock.write_all(b"381 more\r\n").await;
                    let _ = sock.write_all(b"281 authenticated\r\n").await;
                    let _ = sock.write_all(b"220 0 <id> article\r\n").await;
                    // No headers, no body, no terminator: drop the socket.
                });
            }
        });
        (addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn body_read_failure_after_220_invalidates_instead_of_recycling() {
        let (h, p) = spawn_truncated_server().await;
        let store = Arc::new(StaticStore::new(vec![], vec![provider("flaky", 1, h, p)]));
        let registry = Arc::new(ProviderRegistry::new(store, 0));
        registry.refresh().await.unwrap();
        let pools = Arc::new(PoolProvider::new());
        let dispatcher = Dispatcher::new(registry.clone(), pools.clone(), Arc::new(Metrics::new()));

        let err = dispatcher.dispatch("<id>", Verb::Article).await.unwrap_err();
        assert!(matches!(err, Error::NotFoundEverywhere));

        // The leased connection was invalidated, not handed back to idle —
        // a corrupted, half-drained socket must never be recycled.
        let pool = pools.get_pool(&registry.snapshot()[0]);
        assert_eq!(pool.idle_len().await, 0);
        assert_eq!(pool.active_len().await, 0);
    }

    #[tokio::test]
    async fn empty_registry_yields_backend_empty() {
        let store = Arc::new(StaticStore::new(vec![], vec![]));
        let registry = Arc::new(ProviderRegistry::new(store, 0));
        registry.refresh().await.unwrap();
        let dispatcher = Dispatcher::new(registry, Arc::new(PoolProvider::new()), Arc::new(Metrics::new()));
        let err = dispatcher.dispatch("<id>", Verb::Article).await.unwrap_err();
        assert!(matches!(err, Error::BackendEmpty));
    }

    #[tokio::test]
    async fn falls_over_to_second_provider_after_first_misses() {
        let (h1, p1) = spawn_miss_server().await;
        let (h2, p2) = spawn_hit_server().await;
        let store = Arc::new(StaticStore::new(
            vec![],
            vec![provider("miss", 1, h1, p1), provider("hit", 2, h2, p2)],
        ));
        let registry = Arc::new(ProviderRegistry::new(store, 0));
        registry.refresh().await.unwrap();
        let dispatcher = Dispatcher::new(registry, Arc::new(PoolProvider::new()), Arc::new(Metrics::new()));

        let (headers, body) = dispatcher.dispatch("<id>", Verb::Article).await.unwrap();
        assert_eq!(headers.get("subject"), Some("hi"));
        assert_eq!(body, b"body line\r\n".to_vec());
    }

    #[tokio::test]
    async fn all_providers_miss_yields_not_found_everywhere() {
        let (h1, p1) = spawn_miss_server().await;
        let (h2, p2) = spawn_miss_server().await;
        let store = Arc::new(StaticStore::new(
            vec![],
            vec![provider("a", 1, h1, p1), provider("b", 2, h2, p2)],
        ));
        let registry = Arc::new(ProviderRegistry::new(store, 0));
        registry.refresh().await.unwrap();
        let dispatcher = Dispatcher::new(registry, Arc::new(PoolProvider::new()), Arc::new(Metrics::new()));

        let err = dispatcher.dispatch("<id>", Verb::Article).await.unwrap_err();
        assert!(matches!(err, Error::NotFoundEverywhere));
    }

    #[tokio::test]
    async fn route_filter_skips_named_provider() {
        let (h1, p1) = spawn_hit_server().await;
        let store = Arc::new(StaticStore::new(vec![], vec![provider("skip-me", 1, h1, p1)]));
        let registry = Arc::new(ProviderRegistry::new(store, 0));
        registry.refresh().await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let dispatcher = Dispatcher::new(registry, Arc::new(PoolProvider::new()), Arc::new(Metrics::new()))
            .with_filter(Arc::new(move |_id, name| {
                calls2.fetch_add(1, Ordering::SeqCst);
                name == "skip-me"
            }));

        let err = dispatcher.dispatch("<id>", Verb::Body).await.unwrap_err();
        assert!(matches!(err, Error::NotFoundEverywhere));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
