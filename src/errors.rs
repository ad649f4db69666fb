//! Crate-wide error type.
//!
//! Mirrors the error kinds in the design: a structured protocol error that
//! the session server serialises straight back to the client, pool-level
//! control-flow errors the dispatcher treats as "try the next provider", and
//! a `Fatal` variant for conditions main() can't recover from.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// A news-protocol status line the caller should relay verbatim, e.g.
    /// a failed `ReadCodeLine(expect)` or an admission rejection.
    Protocol { code: u16, msg: String },

    /// Pool is at capacity; every slot is leased.
    PoolBusy,

    /// Circuit breaker open: too many consecutive creation failures within
    /// `fail_timeout`.
    PoolDisabled,

    /// Transport-level failure talking to an upstream (connect, read, write).
    Net(std::io::Error),

    /// The upstream's status line matched what the caller expected, but
    /// reading the header block or body that followed it failed (truncated
    /// stream, disconnect mid-drain, ...). The connection's framing state is
    /// unknown at this point and it must not be recycled, regardless of what
    /// kind of error the drain itself produced.
    BodyRead(Box<Error>),

    /// Every configured provider was tried and none returned the article.
    NotFoundEverywhere,

    /// No providers are configured at all.
    BackendEmpty,

    /// Listener bind failure, store unreachable at startup, or anything else
    /// that should end the process.
    Fatal(String),

    /// Local I/O failure (client socket, config file).
    Io(std::io::Error),

    /// Malformed configuration.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol { code, msg } => write!(f, "{} {}", code, msg),
            Error::PoolBusy => write!(f, "pool is busy"),
            Error::PoolDisabled => write!(f, "pool temporarily disabled"),
            Error::Net(e) => write!(f, "network error: {}", e),
            Error::BodyRead(e) => write!(f, "body read failed: {}", e),
            Error::NotFoundEverywhere => write!(f, "430 not found on any provider"),
            Error::BackendEmpty => write!(f, "403 no providers configured"),
            Error::Fatal(s) => write!(f, "fatal: {}", s),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Config(s) => write!(f, "config error: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Net(e) | Error::Io(e) => Some(e),
            Error::BodyRead(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

impl Error {
    /// True for errors the failover dispatcher should treat as "skip this
    /// provider, keep iterating" rather than bubbling up immediately.
    pub fn is_skip_and_continue(&self) -> bool {
        matches!(
            self,
            Error::PoolBusy
                | Error::PoolDisabled
                | Error::Protocol { .. }
                | Error::Net(_)
                | Error::BodyRead(_)
        )
    }

    /// Status code this error should be reported to the client as, if it
    /// reaches the session loop directly (i.e. wasn't already absorbed by
    /// the dispatcher's per-provider handling).
    pub fn as_protocol(&self) -> (u16, String) {
        match self {
            Error::Protocol { code, msg } => (*code, msg.clone()),
            Error::NotFoundEverywhere => (430, "Not found".to_string()),
            Error::BackendEmpty => (403, "Something went wrong".to_string()),
            Error::PoolBusy | Error::PoolDisabled => (430, "Not found".to_string()),
            Error::Net(_) | Error::Io(_) => (400, "Connection failed".to_string()),
            Error::BodyRead(e) => e.as_protocol(),
            Error::Fatal(_) | Error::Config(_) => (403, "Something went wrong".to_string()),
        }
    }
}
