//! End-to-end coverage of the six literal scenarios against a real server
//! socket and, where a provider is involved, a real local TCP listener
//! standing in for it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

use nntplexer::dispatcher::Dispatcher;
use nntplexer::errors::Error;
use nntplexer::metrics::Metrics;
use nntplexer::models::{Provider, User};
use nntplexer::pool::{Pool, PoolProvider, ProviderFactory};
use nntplexer::registry::{ProviderRegistry, UserRegistry};
use nntplexer::server::{Server, ServerCtx};
use nntplexer::session::SessionTable;
use nntplexer::stores::StaticStore;

fn user(name: &str, password: &str, max_conns: u16, ip_sharing: bool) -> User {
    User {
        name: name.to_string(),
        password_hash: hex::encode(Sha256::digest(password.as_bytes())),
        max_conns,
        ip_sharing,
        rx_bytes: 0,
    }
}

fn provider(name: &str, priority: u16, host: String, port: u16) -> Provider {
    Provider {
        name: name.to_string(),
        host,
        port,
        user: String::new(),
        pass: String::new(),
        use_tls: false,
        priority,
        max_conns: 1,
        max_fails: 3,
        fail_timeout: 10,
        connect_timeout_ms: 500,
        enabled: true,
        retention_days: 0,
    }
}

/// Binds and spawns a full `Server` on an ephemeral port, returning the
/// address clients should connect to.
async fn spawn_server(users: Vec<User>, providers: Vec<Provider>) -> SocketAddr {
    let store = Arc::new(StaticStore::new(users, providers));
    let user_registry = Arc::new(UserRegistry::new(store.clone()));
    let provider_registry = Arc::new(ProviderRegistry::new(store, 0));
    user_registry.refresh().await.unwrap();
    provider_registry.refresh().await.unwrap();

    let metrics = Arc::new(Metrics::new());
    let pools = Arc::new(PoolProvider::new());
    let dispatcher = Arc::new(Dispatcher::new(provider_registry, pools, metrics.clone()));
    let sessions = Arc::new(SessionTable::new(metrics.clone()));
    let ctx = ServerCtx {
        users: user_registry,
        dispatcher,
        sessions,
        metrics,
        proxy_protocol: false,
    };

    let server = Server::bind("127.0.0.1:0", ctx).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

/// A mock upstream provider: greets, answers `AUTHINFO USER`/`PASS`, then
/// writes `response` once per subsequent command line it reads — so a
/// connection the pool hands out a second time still gets answered.
async fn spawn_provider(response: &'static [u8]) -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut sock = BufReader::new(sock);
                if sock.get_mut().write_all(b"200 ok\r\n").await.is_err() {
                    return;
                }
                let _ = sock.get_mut().write_all(b"381 more\r\n").await;
                let _ = sock.get_mut().write_all(b"281 authenticated\r\n").await;
                loop {
                    let mut line = String::new();
                    match sock.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    if sock.get_mut().write_all(response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr.ip().to_string(), addr.port())
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line.trim_end().to_string()
}

/// Reads lines up to and including one containing only `.`, returning them
/// joined back with `\r\n` (the literal scenarios assert on exact bytes).
async fn read_until_dot(reader: &mut BufReader<OwnedReadHalf>) -> String {
    let mut out = String::new();
    loop {
        let line = read_line(reader).await;
        if line == "." {
            out.push_str(".\r\n");
            break;
        }
        out.push_str(&line);
        out.push_str("\r\n");
    }
    out
}

async fn connect(addr: SocketAddr) -> (BufReader<OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half), write_half)
}

/// Scenario 1: greeting, then a successful AUTHINFO USER/PASS exchange.
#[tokio::test]
async fn scenario_1_greeting_and_auth_flow() {
    let addr = spawn_server(vec![user("alice", "correct", 2, true)], vec![]).await;
    let (mut reader, mut writer) = connect(addr).await;

    assert_eq!(read_line(&mut reader).await, "201 Hi!");

    writer.write_all(b"AUTHINFO USER alice\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "381 Password required");

    writer.write_all(b"AUTHINFO PASS correct\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "281 Authentication accepted");
}

/// An already-authenticated session that sends `AUTHINFO` again is rejected
/// outright instead of re-running admission — otherwise a second `AUTHINFO
/// USER <other>` / `AUTHINFO PASS <other>` would admit a second session
/// under `other`'s bucket while the first username's entry in the session
/// table is never removed on disconnect.
#[tokio::test]
async fn reauthinfo_after_authed_is_rejected_and_does_not_leak_session_slot() {
    let addr = spawn_server(
        vec![
            user("alice", "correct", 1, true),
            user("bob", "hunter2", 2, true),
        ],
        vec![],
    )
    .await;

    let (mut reader, mut writer) = connect(addr).await;
    read_line(&mut reader).await; // greeting
    writer.write_all(b"AUTHINFO USER alice\r\n").await.unwrap();
    read_line(&mut reader).await;
    writer.write_all(b"AUTHINFO PASS correct\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "281 Authentication accepted");

    // Re-authenticating as a different user on the same, already-authed
    // connection must not succeed.
    writer.write_all(b"AUTHINFO USER bob\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "502 Command unavailable");
    writer.write_all(b"AUTHINFO PASS hunter2\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "502 Command unavailable");

    // alice's cap is 1: a second connection for alice is still rejected,
    // proving the first login is still the only entry under her name (not
    // duplicated, and not silently swapped out for bob's).
    let (mut reader2, mut writer2) = connect(addr).await;
    read_line(&mut reader2).await;
    writer2.write_all(b"AUTHINFO USER alice\r\n").await.unwrap();
    read_line(&mut reader2).await;
    writer2.write_all(b"AUTHINFO PASS correct\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader2).await, "502 Too many connections");
}

/// Scenario 2: provider A answers 430, provider B answers 220 with a
/// header and body; the client sees B's article verbatim.
#[tokio::test]
async fn scenario_2_failover_then_success() {
    let (ha, pa) = spawn_provider(b"430 no such article\r\n").await;
    let (hb, pb) = spawn_provider(b"220 0 <abc@x> article\r\nSubject: hi\r\n\r\nhello\r\n.\r\n").await;

    let addr = spawn_server(
        vec![user("alice", "correct", 2, true)],
        vec![provider("a", 1, ha, pa), provider("b", 2, hb, pb)],
    )
    .await;
    let (mut reader, mut writer) = connect(addr).await;
    read_line(&mut reader).await; // greeting
    writer.write_all(b"AUTHINFO USER alice\r\n").await.unwrap();
    read_line(&mut reader).await;
    writer.write_all(b"AUTHINFO PASS correct\r\n").await.unwrap();
    read_line(&mut reader).await;

    writer.write_all(b"ARTICLE <abc@x>\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "222 0 <abc@x>");
    let rest = read_until_dot(&mut reader).await;
    assert_eq!(rest, "Subject: hi\r\n\r\nhello\r\n.\r\n");
}

/// Scenario 3: BODY with a dot-stuffed line is relayed un-stuffed then
/// re-stuffed exactly, with no header block.
#[tokio::test]
async fn scenario_3_body_dot_stuffing() {
    let (h, p) = spawn_provider(b"222 0 <z@y> body\r\nline1\r\n..hidden\r\n.\r\n").await;
    let addr = spawn_server(
        vec![user("alice", "correct", 2, true)],
        vec![provider("only", 1, h, p)],
    )
    .await;
    let (mut reader, mut writer) = connect(addr).await;
    read_line(&mut reader).await;
    writer.write_all(b"AUTHINFO USER alice\r\n").await.unwrap();
    read_line(&mut reader).await;
    writer.write_all(b"AUTHINFO PASS correct\r\n").await.unwrap();
    read_line(&mut reader).await;

    writer.write_all(b"BODY <z@y>\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "222 0 <z@y>");
    let rest = read_until_dot(&mut reader).await;
    assert_eq!(rest, "line1\r\n..hidden\r\n.\r\n");
}

/// Scenario 4: after `max_fails` consecutive dial failures the circuit
/// breaker refuses further attempts until `fail_timeout` elapses.
#[tokio::test]
async fn scenario_4_circuit_breaker_timing() {
    let dead_provider = provider("dead", 1, "127.0.0.1".to_string(), 1);
    let factory = Arc::new(ProviderFactory::new(dead_provider));
    let pool = Pool::new(factory, 1, 3, Duration::from_millis(100));

    assert!(matches!(pool.get().await, Err(Error::Net(_))));
    assert!(matches!(pool.get().await, Err(Error::Net(_))));
    assert!(matches!(pool.get().await, Err(Error::PoolDisabled)));
    assert!(matches!(pool.get().await, Err(Error::PoolDisabled)));

    tokio::time::sleep(Duration::from_millis(120)).await;
    // Timeout elapsed: the breaker attempts the factory again instead of
    // refusing outright from a stale `last_check`. It fails again (nothing
    // listens on port 1) and `fails` was already at the threshold, so the
    // outcome is still `PoolDisabled` — the fresh-attempt invariant itself
    // (with a factory that can observe it was actually called) is covered
    // by `pool::tests::circuit_breaker_opens_after_max_fails_and_recloses_after_timeout`.
    assert!(matches!(pool.get().await, Err(Error::PoolDisabled)));
}

/// Scenario 5: a third login for a 2-connection user from the same IP is
/// rejected with `502 Too many connections`.
#[tokio::test]
async fn scenario_5_admission_connection_limit() {
    let addr = spawn_server(vec![user("bob", "hunter2", 2, false)], vec![]).await;

    let mut sessions = Vec::new();
    for _ in 0..2 {
        let (mut reader, mut writer) = connect(addr).await;
        read_line(&mut reader).await;
        writer.write_all(b"AUTHINFO USER bob\r\n").await.unwrap();
        read_line(&mut reader).await;
        writer.write_all(b"AUTHINFO PASS hunter2\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "281 Authentication accepted");
        sessions.push((reader, writer));
    }

    let (mut reader, mut writer) = connect(addr).await;
    read_line(&mut reader).await;
    writer.write_all(b"AUTHINFO USER bob\r\n").await.unwrap();
    read_line(&mut reader).await;
    writer.write_all(b"AUTHINFO PASS hunter2\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "502 Too many connections");
}

/// Scenario 6: the client disappears mid-body; the provider connection was
/// already handed back to the pool, so a fresh request through the
/// capacity-1 pool still succeeds instead of hanging on `PoolBusy`.
#[tokio::test]
async fn scenario_6_disconnect_mid_body_releases_pool_slot() {
    let (h, p) = spawn_provider(b"220 0 <a> article\r\n\r\nhello\r\n.\r\n").await;
    let addr = spawn_server(
        vec![user("alice", "correct", 5, true)],
        vec![provider("only", 1, h, p)],
    )
    .await;

    {
        let (mut reader, mut writer) = connect(addr).await;
        read_line(&mut reader).await;
        writer.write_all(b"AUTHINFO USER alice\r\n").await.unwrap();
        read_line(&mut reader).await;
        writer.write_all(b"AUTHINFO PASS correct\r\n").await.unwrap();
        read_line(&mut reader).await;
        writer.write_all(b"ARTICLE <a>\r\n").await.unwrap();
        // Disconnect immediately, before reading any of the reply.
    }

    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut reader, mut writer) = connect(addr).await;
    read_line(&mut reader).await;
    writer.write_all(b"AUTHINFO USER alice\r\n").await.unwrap();
    read_line(&mut reader).await;
    writer.write_all(b"AUTHINFO PASS correct\r\n").await.unwrap();
    read_line(&mut reader).await;
    writer.write_all(b"ARTICLE <a>\r\n").await.unwrap();
    assert_eq!(read_line(&mut reader).await, "222 0 <a>");
}
