//! Line-oriented framing for the news protocol: status lines, MIME-style
//! header blocks and dot-stuffed multi-line bodies, over any duplex byte
//! stream (plain TCP or a TLS-wrapped one — `LineCodec` is generic over the
//! transport, same as the upstream client needs for both).

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::Error;

/// A parsed MIME-style header block: case-insensitive names, each keeping
/// every value it was given, in the order headers were read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeHeader {
    entries: Vec<(String, Vec<String>)>,
}

impl MimeHeader {
    pub fn new() -> Self {
        MimeHeader::default()
    }

    pub fn add(&mut self, name: &str, value: String) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1.push(value);
        } else {
            self.entries.push((name.to_string(), vec![value]));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(name, value)` pairs in insertion order, one pair per value
    /// for headers that repeated.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, vs)| vs.iter().map(move |v| (n.as_str(), v.as_str())))
    }
}

/// Dot-stuffs a body so it can be framed as a news-protocol multi-line
/// block: any line starting with `.` gets an extra leading `.`.
///
/// `dot_unstuff` is its exact inverse on any byte sequence — this is the
/// round-trip law the pool and dispatcher rely on implicitly by trusting
/// that what goes in over the wire comes back out unchanged.
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut at_line_start = true;
    for &b in body {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = b == b'\n';
    }
    out
}

pub fn dot_unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut at_line_start = true;
    let mut i = 0;
    while i < data.len() {
        if at_line_start && data[i] == b'.' {
            i += 1;
            if i >= data.len() {
                break;
            }
        }
        out.push(data[i]);
        at_line_start = data[i] == b'\n';
        i += 1;
    }
    out
}

fn strip_eol(buf: &mut Vec<u8>) {
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
}

fn parse_status_line(line: &str) -> Result<(u16, String), Error> {
    let line = line.trim();
    let mut parts = line.splitn(2, ' ');
    let code = parts
        .next()
        .unwrap_or("")
        .parse::<u16>()
        .map_err(|_| Error::Protocol {
            code: 0,
            msg: format!("malformed status line: {}", line),
        })?;
    let msg = parts.next().unwrap_or("").to_string();
    Ok((code, msg))
}

/// Frames command lines and dot-stuffed bodies over a duplex stream.
///
/// Reads are buffered (`BufReader`); writes pass straight through to the
/// inner stream, since command/response lines are small and this crate never
/// pipelines — the next command is only read once the previous reply is
/// fully written.
pub struct LineCodec<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineCodec<S> {
    pub fn new(stream: S) -> Self {
        LineCodec {
            stream: BufReader::new(stream),
        }
    }

    /// Wraps an already-buffered reader instead of starting a fresh
    /// `BufReader`. Used after [`crate::proxy_protocol::read_header`] has
    /// peeked/consumed bytes off the same buffer — reconstructing from the
    /// inner stream would drop whatever the buffer had already read ahead.
    pub fn from_buf_reader(stream: BufReader<S>) -> Self {
        LineCodec { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// One CRLF-delimited line, stripped of its terminator.
    pub async fn read_line(&mut self) -> Result<String, Error> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Err(Error::Protocol {
                code: 0,
                msg: "unexpected EOF".to_string(),
            });
        }
        strip_eol(&mut buf);
        String::from_utf8(buf).map_err(|_| Error::Protocol {
            code: 0,
            msg: "non-UTF8 line".to_string(),
        })
    }

    pub async fn write_line(&mut self, code: u16, msg: &str) -> Result<(), Error> {
        let line = format!("{} {}\r\n", code, msg);
        self.stream.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Writes a bare line with no status-code prefix (used for capability
    /// list entries and the like, which ride inside a dot-terminated block).
    pub async fn write_raw_line(&mut self, text: &str) -> Result<(), Error> {
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        Ok(())
    }

    /// Reads a status line and fails with `Error::Protocol` if its code
    /// doesn't match `expect`.
    pub async fn read_code_line(&mut self, expect: u16) -> Result<(u16, String), Error> {
        let line = self.read_line().await?;
        let (code, msg) = parse_status_line(&line)?;
        if code != expect {
            return Err(Error::Protocol { code, msg });
        }
        Ok((code, msg))
    }

    /// Reads a status line without enforcing an expected code.
    pub async fn read_any_code_line(&mut self) -> Result<(u16, String), Error> {
        let line = self.read_line().await?;
        parse_status_line(&line)
    }

    /// Reads header lines (`Name: value`) until a blank line.
    pub async fn read_mime_header(&mut self) -> Result<MimeHeader, Error> {
        let mut headers = MimeHeader::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            match line.split_once(':') {
                Some((name, value)) => headers.add(name.trim(), value.trim().to_string()),
                None => {
                    return Err(Error::Protocol {
                        code: 0,
                        msg: format!("malformed header line: {}", line),
                    })
                }
            }
        }
        Ok(headers)
    }

    /// Reads a dot-terminated multi-line body, un-stuffing as it goes, and
    /// returns it fully assembled. The caller reads the whole body before
    /// the pool slot is released.
    pub async fn read_dotted_body(&mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        loop {
            let mut line = Vec::new();
            let n = self.stream.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(Error::Protocol {
                    code: 0,
                    msg: "truncated dot-stream".to_string(),
                });
            }
            strip_eol(&mut line);
            if line == b"." {
                break;
            }
            if line.first() == Some(&b'.') {
                line.remove(0);
            }
            out.extend_from_slice(&line);
            out.extend_from_slice(b"\r\n");
        }
        Ok(out)
    }

    /// Reads dot-terminated lines as strings (used for CAPABILITIES).
    pub async fn read_dot_lines(&mut self) -> Result<Vec<String>, Error> {
        let raw = self.read_dotted_body().await?;
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Writes `body` dot-stuffed, line by line, terminated by `.\r\n`.
    ///
    /// `body` is expected in `read_dotted_body`'s own output shape: every
    /// line, including the last, ends in `\r\n`. A single trailing `\n` is
    /// stripped before splitting so that shape doesn't produce a spurious
    /// blank line ahead of the terminator.
    pub async fn write_dotted_body(&mut self, body: &[u8]) -> Result<(), Error> {
        if body.is_empty() {
            self.stream.write_all(b".\r\n").await?;
            return Ok(());
        }
        let body = body.strip_suffix(b"\n").unwrap_or(body);
        for line in body.split(|&b| b == b'\n') {
            let mut line = line;
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.first() == Some(&b'.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush().await?;
        Ok(())
    }
}
