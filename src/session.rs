//! Per-connection session state and the process-wide session table, which
//! answers admission control's two questions: "how many sessions does this
//! user already have?" and "from which IPs?".

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::RngCore;

use crate::metrics::Metrics;
use crate::models::User;

/// One client connection's identity, as tracked by the session table. The
/// line-framed connection itself lives in the per-connection task
/// (`crate::server`), not here — only what admission control needs.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub remote_ip: IpAddr,
    pub user: String,
}

impl Session {
    pub fn new(remote_ip: IpAddr) -> Self {
        Session {
            id: new_session_id(),
            remote_ip,
            user: String::new(),
        }
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `user name -> live sessions`. Every mutation (admit or remove) takes the
/// exclusive lock; stats reads used by admission share that same lock so
/// the check-then-insert in `try_admit` can't race.
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Vec<Session>>>,
    metrics: Arc<Metrics>,
}

impl SessionTable {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        SessionTable {
            sessions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Runs `CheckConnLimit` and `CheckIpLimit` and, if both pass, records
    /// `session` — all under one write lock, so admission and insert happen
    /// atomically. Returns the `(code, msg)` to report on rejection.
    pub fn try_admit(&self, user: &User, session: Session) -> Result<(), (u16, String)> {
        let mut table = self.sessions.write();
        let existing = table.get(&user.name).map(|v| v.as_slice()).unwrap_or(&[]);

        let conns = existing.len();
        if !(conns < user.max_conns as usize) {
            return Err((502, "Too many connections".to_string()));
        }

        let mut ips: HashMap<IpAddr, usize> = HashMap::new();
        for s in existing {
            *ips.entry(s.remote_ip).or_insert(0) += 1;
        }
        let ip_ok = user.ip_sharing || ips.is_empty() || ips.contains_key(&session.remote_ip);
        if !ip_ok {
            return Err((502, "IP sharing not allowed".to_string()));
        }

        table.entry(user.name.clone()).or_default().push(session);
        self.metrics.session_opened();
        Ok(())
    }

    /// Removes `session_id` from `user`'s list, if present. Safe to call on
    /// a session that was never admitted (e.g. connection closed before
    /// authenticating) — it's simply a no-op.
    pub fn remove(&self, user: &str, session_id: &str) {
        if user.is_empty() {
            return;
        }
        let mut table = self.sessions.write();
        if let Some(list) = table.get_mut(user) {
            if let Some(pos) = list.iter().position(|s| s.id == session_id) {
                list.remove(pos);
                self.metrics.session_closed();
            }
            if list.is_empty() {
                table.remove(user);
            }
        }
    }

    #[cfg(test)]
    pub fn session_count(&self, user: &str) -> usize {
        self.sessions.read().get(user).map(Vec::len).unwrap_or(0)
    }
}
