//! Best-effort instrumentation: counter/gauge failures must never affect
//! request handling. This is the in-process counter set; wiring it up to an
//! actual exporter (Prometheus, statsd, ...) over a `promhttp`-style
//! endpoint is left to the deployment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

#[derive(Default)]
struct Counters {
    requests_by_command: RwLock<HashMap<String, AtomicU64>>,
    responses_by_code: RwLock<HashMap<u16, AtomicU64>>,
    backend_requests: RwLock<HashMap<(String, String), AtomicU64>>,
    backend_bytes: RwLock<HashMap<String, AtomicU64>>,
    article_requests: AtomicU64,
    sessions: AtomicI64,
}

fn bump(map: &RwLock<HashMap<String, AtomicU64>>, key: &str) {
    if let Some(counter) = map.read().get(key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    map.write()
        .entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

/// Process-wide metrics sink. Cheap to clone (an `Arc` underneath via
/// `Metrics::shared`), safe to share across every session task.
#[derive(Default)]
pub struct Metrics {
    counters: Counters,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn inc_request(&self, command: &str) {
        bump(&self.counters.requests_by_command, &command.to_lowercase());
    }

    pub fn inc_response(&self, code: u16) {
        if let Some(counter) = self.counters.responses_by_code.read().get(&code) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .responses_by_code
            .write()
            .entry(code)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_article_request(&self) {
        self.counters.article_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_request(&self, provider: &str, upstream_code: &str) {
        let key = (provider.to_string(), upstream_code.to_string());
        if let Some(counter) = self.counters.backend_requests.read().get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .backend_requests
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_backend_bytes(&self, provider: &str, bytes: u64) {
        if let Some(counter) = self.counters.backend_bytes.read().get(provider) {
            counter.fetch_add(bytes, Ordering::Relaxed);
            return;
        }
        self.counters
            .backend_bytes
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.counters.sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_gauge(&self) -> i64 {
        self.counters.sessions.load(Ordering::Relaxed)
    }

    /// Inert per-user byte counter. Kept as a metrics-only hook; never
    /// persisted.
    pub fn add_user_bytes(&self, _user: &str, _rx: u64, _tx: u64) {}
}
