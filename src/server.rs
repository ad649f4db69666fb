//! Session server: accepts connections, drives the per-session state
//! machine (Greet → Unauth → Authed → Closed), enforces admission caps and
//! dispatches `ARTICLE`/`BODY`/`CAPABILITIES`/`AUTHINFO`/`QUIT`.

use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};
use sha2::{Digest, Sha256};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};

use crate::codec::LineCodec;
use crate::dispatcher::{Dispatcher, Verb};
use crate::errors::Error;
use crate::metrics::Metrics;
use crate::proxy_protocol;
use crate::registry::UserRegistry;
use crate::session::{Session, SessionTable};

/// Shared handles every accepted connection's task needs. Cheap to clone
/// (all fields are `Arc`s).
#[derive(Clone)]
pub struct ServerCtx {
    pub users: Arc<UserRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionTable>,
    pub metrics: Arc<Metrics>,
    pub proxy_protocol: bool,
}

pub struct Server {
    listener: TcpListener,
    ctx: ServerCtx,
}

impl Server {
    pub async fn bind(addr: &str, ctx: ServerCtx) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Fatal(format!("bind {}: {}", addr, e)))?;
        info!("[server] listening on {}", addr);
        Ok(Server { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop forever, one task per connection. Returns only
    /// on a fatal listener error.
    pub async fn serve(self) -> Result<(), Error> {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| Error::Fatal(format!("accept: {}", e)))?;
            let ctx = self.ctx.clone();
            let peer_ip = peer.ip();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_ip, ctx).await {
                    warn!("[server] session ended with error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer_ip: IpAddr, ctx: ServerCtx) -> Result<(), Error> {
    let mut buffered = BufReader::new(stream);
    let remote_ip = if ctx.proxy_protocol {
        match proxy_protocol::read_header(&mut buffered).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("[server] PROXY protocol header rejected from {}: {}", peer_ip, e);
                return Err(e);
            }
        }
    } else {
        peer_ip
    };

    let codec = LineCodec::from_buf_reader(buffered);
    run_session(codec, remote_ip, &ctx).await
}

fn split_verb(line: &str) -> (String, String) {
    match line.trim().split_once(' ') {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim().to_string()),
        None => (line.trim().to_ascii_uppercase(), String::new()),
    }
}

async fn respond(codec: &mut LineCodec<TcpStream>, metrics: &Metrics, code: u16, msg: &str) -> Result<(), Error> {
    metrics.inc_response(code);
    codec.write_line(code, msg).await
}

async fn write_capabilities(codec: &mut LineCodec<TcpStream>, metrics: &Metrics, authed: bool) -> Result<(), Error> {
    metrics.inc_response(101);
    codec.write_line(101, "Capabilities follow").await?;
    codec.write_raw_line("VERSION 2").await?;
    if authed {
        codec.write_raw_line("READER").await?;
    } else {
        codec.write_raw_line("AUTHINFO USER PASS").await?;
    }
    codec.write_raw_line(".").await?;
    Ok(())
}

/// Drives one connection from greeting through to close. `codec` owns the
/// client socket for the whole session — no pipelining: the next line is
/// read only after the previous reply finished.
async fn run_session(mut codec: LineCodec<TcpStream>, remote_ip: IpAddr, ctx: &ServerCtx) -> Result<(), Error> {
    codec.write_line(201, "Hi!").await?;

    let session = Session::new(remote_ip);
    let session_id = session.id.clone();
    let mut user_name = String::new();
    let mut awaiting_pass = false;
    let mut authed = false;

    let result = loop {
        let line = match codec.read_line().await {
            Ok(l) => l,
            Err(_) => break Ok(()),
        };
        ctx.metrics.inc_request(line.split(' ').next().unwrap_or(""));
        let (verb, rest) = split_verb(&line);

        match verb.as_str() {
            "CAPABILITIES" => {
                write_capabilities(&mut codec, &ctx.metrics, authed).await?;
            }
            "AUTHINFO" if authed => {
                respond(&mut codec, &ctx.metrics, 502, "Command unavailable").await?;
            }
            "AUTHINFO" => {
                let (sub, arg) = split_verb(&rest);
                match sub.as_str() {
                    "USER" => {
                        user_name = arg;
                        awaiting_pass = true;
                        respond(&mut codec, &ctx.metrics, 381, "Password required").await?;
                    }
                    "PASS" => {
                        if !awaiting_pass || user_name.is_empty() {
                            respond(&mut codec, &ctx.metrics, 482, "Authentication commands out of sequence").await?;
                        } else {
                            match authenticate(ctx, &user_name, &arg, remote_ip, &session_id) {
                                Ok(()) => {
                                    authed = true;
                                    respond(&mut codec, &ctx.metrics, 281, "Authentication accepted").await?;
                                }
                                Err((code, msg)) => {
                                    respond(&mut codec, &ctx.metrics, code, &msg).await?;
                                }
                            }
                        }
                    }
                    _ => {
                        respond(&mut codec, &ctx.metrics, 501, "Syntax error").await?;
                    }
                }
            }
            "ARTICLE" | "BODY" if !authed => {
                respond(&mut codec, &ctx.metrics, 480, "Authentication required").await?;
            }
            "ARTICLE" => {
                let verb = Verb::Article;
                dispatch_article(&mut codec, ctx, &user_name, &rest, verb).await?;
            }
            "BODY" => {
                let verb = Verb::Body;
                dispatch_article(&mut codec, ctx, &user_name, &rest, verb).await?;
            }
            "QUIT" => {
                respond(&mut codec, &ctx.metrics, 205, "Bye!").await?;
                break Ok(());
            }
            // Known-but-unimplemented verbs: preserved bug, not fixed — see DESIGN.md.
            "HEAD" | "GROUP" | "LIST" | "MODE" | "STAT" => {
                respond(&mut codec, &ctx.metrics, 205, "Bye!").await?;
                break Ok(());
            }
            _ => {
                respond(&mut codec, &ctx.metrics, 500, "Unrecognized command").await?;
            }
        }
    };

    if authed {
        ctx.sessions.remove(&user_name, &session_id);
    }
    result
}

/// `AUTHINFO PASS` admission check: verifies the password hash, then runs
/// `SessionTable::try_admit` under its own lock. Returns the client-facing
/// `(code, msg)` on any rejection.
fn authenticate(
    ctx: &ServerCtx,
    user_name: &str,
    password: &str,
    remote_ip: IpAddr,
    session_id: &str,
) -> Result<(), (u16, String)> {
    let user = ctx
        .users
        .get(user_name)
        .ok_or((481, "Authentication failed".to_string()))?;

    let hash = hex::encode(Sha256::digest(password.as_bytes()));
    if hash != user.password_hash {
        return Err((481, "Authentication failed".to_string()));
    }

    let session = Session {
        id: session_id.to_string(),
        remote_ip,
        user: user.name.clone(),
    };
    ctx.sessions.try_admit(&user, session)
}

async fn dispatch_article(
    codec: &mut LineCodec<TcpStream>,
    ctx: &ServerCtx,
    user_name: &str,
    message_id: &str,
    verb: Verb,
) -> Result<(), Error> {
    match ctx.dispatcher.dispatch(message_id, verb).await {
        Ok((headers, body)) => {
            ctx.metrics.inc_response(222);
            codec.write_line(222, &format!("0 {}", message_id)).await?;
            if verb == Verb::Article {
                for (name, value) in headers.iter() {
                    codec.write_raw_line(&format!("{}: {}", name, value)).await?;
                }
                if !headers.is_empty() {
                    codec.write_raw_line("").await?;
                }
            }
            let result = codec.write_dotted_body(&body).await;
            if result.is_ok() {
                ctx.metrics.add_user_bytes(user_name, 0, body.len() as u64);
            }
            result
        }
        Err(e) => {
            let (code, msg) = e.as_protocol();
            respond(codec, &ctx.metrics, code, &msg).await
        }
    }
}
