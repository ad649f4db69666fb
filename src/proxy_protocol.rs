//! Optional PROXY protocol v1 (text) / v2 (binary) header, parsed on accept
//! so the session server can adopt the real client address before sending
//! the news-protocol greeting.

use std::net::IpAddr;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::errors::Error;

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Reads a PROXY protocol header off `stream` if present and returns the
/// source address it declares. `stream` must not yet have had any bytes
/// consumed by the caller — this always runs first, before the greeting.
pub async fn read_header<S>(stream: &mut BufReader<S>) -> Result<IpAddr, Error>
where
    S: AsyncRead + Unpin,
{
    let peek = stream.fill_buf().await?;
    if peek.len() >= 12 && peek[..12] == V2_SIGNATURE {
        read_v2(stream).await
    } else {
        read_v1(stream).await
    }
}

async fn read_v1<S: AsyncRead + Unpin>(stream: &mut BufReader<S>) -> Result<IpAddr, Error> {
    let mut line = String::new();
    stream.read_line(&mut line).await?;
    let line = line.trim_end();
    // "PROXY TCP4 <src> <dst> <srcport> <dstport>"
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() < 6 || parts[0] != "PROXY" {
        return Err(Error::Protocol {
            code: 0,
            msg: "malformed PROXY v1 header".to_string(),
        });
    }
    parts[2].parse::<IpAddr>().map_err(|_| Error::Protocol {
        code: 0,
        msg: "malformed PROXY v1 source address".to_string(),
    })
}

async fn read_v2<S: AsyncRead + Unpin>(stream: &mut BufReader<S>) -> Result<IpAddr, Error> {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await?;

    let ver_cmd = header[12];
    let fam_proto = header[13];
    let len = u16::from_be_bytes([header[14], header[15]]) as usize;

    let mut addr_buf = vec![0u8; len];
    stream.read_exact(&mut addr_buf).await?;

    if ver_cmd >> 4 != 2 {
        return Err(Error::Protocol {
            code: 0,
            msg: "unsupported PROXY protocol version".to_string(),
        });
    }

    // LOCAL command carries no meaningful address; keep the transport peer.
    if ver_cmd & 0x0F == 0 {
        return Err(Error::Protocol {
            code: 0,
            msg: "PROXY v2 LOCAL command has no address".to_string(),
        });
    }

    match fam_proto >> 4 {
        // AF_INET
        0x1 if addr_buf.len() >= 4 => {
            Ok(IpAddr::from([addr_buf[0], addr_buf[1], addr_buf[2], addr_buf[3]]))
        }
        // AF_INET6
        0x2 if addr_buf.len() >= 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr_buf[..16]);
            Ok(IpAddr::from(octets))
        }
        _ => Err(Error::Protocol {
            code: 0,
            msg: "unsupported PROXY v2 address family".to_string(),
        }),
    }
}
