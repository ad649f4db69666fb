//! Speaks the news protocol to exactly one upstream provider: greeting,
//! `AUTHINFO`, `ARTICLE`, `BODY`, `CAPABILITIES`. One instance wraps one TCP
//! (optionally TLS-wrapped) connection; the pool owns its lifetime.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use once_cell::sync::Lazy;
use rustls::{OwnedTrustAnchor, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::codec::{LineCodec, MimeHeader};
use crate::errors::Error;

static TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
});

/// The duplex byte stream underlying an [`UpstreamClient`]: either a bare
/// TCP socket or one wrapped in TLS. Both halves implement `AsyncRead` +
/// `AsyncWrite`, so `LineCodec` never needs to know which one it has.
enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Per-provider dial parameters (a narrowed view of [`crate::models::Provider`]).
#[derive(Debug, Clone)]
pub struct DialConfig {
    pub connect_timeout: Duration,
    pub use_tls: bool,
}

/// One connection to one upstream provider.
pub struct UpstreamClient {
    codec: LineCodec<Transport>,
    code: u16,
    message: String,
}

impl UpstreamClient {
    /// Opens the transport and reads the greeting banner, failing unless it
    /// reports a 20x status.
    pub async fn dial(host: &str, port: u16, cfg: &DialConfig) -> Result<Self, Error> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(cfg.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Net(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(Error::Net)?;

        let transport = if cfg.use_tls {
            let server_name = rustls::ServerName::try_from(host).map_err(|_| {
                Error::Net(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid TLS server name",
                ))
            })?;
            let connector = TlsConnector::from(TLS_CONFIG.clone());
            let tls = timeout(cfg.connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| {
                    Error::Net(io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))
                })?
                .map_err(Error::Net)?;
            Transport::Tls(Box::new(tls))
        } else {
            Transport::Plain(tcp)
        };

        let mut codec = LineCodec::new(transport);
        let (code, message) = codec.read_any_code_line().await.map_err(to_net)?;
        if code / 100 != 2 {
            return Err(Error::Protocol { code, msg: message });
        }

        Ok(UpstreamClient {
            codec,
            code,
            message,
        })
    }

    /// `AUTHINFO USER` / `AUTHINFO PASS`, expecting 381 then 281.
    pub async fn authenticate(&mut self, user: &str, pass: &str) -> Result<(), Error> {
        self.command(381, &format!("AUTHINFO USER {}", user)).await?;
        self.command(281, &format!("AUTHINFO PASS {}", pass)).await?;
        Ok(())
    }

    /// `ARTICLE <id>`, expecting 220. Returns headers and the fully-drained,
    /// un-stuffed body — read to completion here and handed back as an
    /// owned buffer rather than a lazy reader, so the pool slot can be
    /// returned before a slow client finishes reading it.
    ///
    /// Once the status line matches, any failure draining the header block
    /// or body comes back as `Error::BodyRead` rather than bare `Net`/
    /// `Protocol` — the connection's framing state is unknown past that
    /// point and the dispatcher must invalidate it unconditionally.
    pub async fn article(&mut self, message_id: &str) -> Result<(MimeHeader, Vec<u8>), Error> {
        self.command(220, &format!("ARTICLE {}", message_id)).await?;
        let headers = self
            .codec
            .read_mime_header()
            .await
            .map_err(to_net)
            .map_err(|e| Error::BodyRead(Box::new(e)))?;
        let body = self
            .codec
            .read_dotted_body()
            .await
            .map_err(to_net)
            .map_err(|e| Error::BodyRead(Box::new(e)))?;
        Ok((headers, body))
    }

    /// `BODY <id>`, expecting 222. No headers. See [`Self::article`] for why
    /// a drain failure comes back as `Error::BodyRead`.
    pub async fn body(&mut self, message_id: &str) -> Result<(MimeHeader, Vec<u8>), Error> {
        self.command(222, &format!("BODY {}", message_id)).await?;
        let body = self
            .codec
            .read_dotted_body()
            .await
            .map_err(to_net)
            .map_err(|e| Error::BodyRead(Box::new(e)))?;
        Ok((MimeHeader::new(), body))
    }

    /// `CAPABILITIES`, expecting 101. Not on the dispatcher's hot path today
    /// — kept available for a future health-check.
    pub async fn capabilities(&mut self) -> Result<Vec<String>, Error> {
        self.command(101, "CAPABILITIES").await?;
        self.codec.read_dot_lines().await.map_err(to_net)
    }

    pub fn last_response(&self) -> (u16, &str) {
        (self.code, &self.message)
    }

    pub async fn close(self) {
        let _ = self.codec.into_inner();
    }

    async fn command(&mut self, expect: u16, line: &str) -> Result<(), Error> {
        self.codec.write_raw_line(line).await.map_err(to_net)?;
        let (code, message) = self.codec.read_code_line(expect).await.map_err(to_net)?;
        self.code = code;
        self.message = message;
        Ok(())
    }
}

/// Reclassifies a codec-level local-I/O error as a transport failure talking
/// to the upstream provider this client dialed — everything past `dial()`
/// reads and writes over that same socket, so any `Error::Io` surfacing here
/// is really `Error::Net` in `errors.rs`'s sense. Leaves `Error::Protocol`
/// (a legitimate status-code mismatch) untouched.
fn to_net(e: Error) -> Error {
    match e {
        Error::Io(io) => Error::Net(io),
        other => other,
    }
}

/// Resolves a provider's remote address to an [`IpAddr`], used only for
/// logging/metrics labels — dialing itself goes through `TcpStream::connect`
/// which does its own resolution.
pub fn peer_description(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => format!("{}:{}", ip, port),
        Err(_) => format!("{}:{}", host, port),
    }
}
