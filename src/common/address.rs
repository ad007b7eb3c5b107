//! Type-tagged destination address frame.
//!
//! ```text
//! +------+----------------------------------+----------+
//! | ATYP | 0x01: 4B | 0x03: 1B len + N B | 0x04: 16B | PORT(2B) |
//! +------+----------------------------------+----------+
//! ```
//!
//! Shared by the ss handler/connector and the address part of SOCKS5
//! requests and replies.

use bytes::{Buf, BufMut, BytesMut};
use easy_error::{Error, ResultExt, bail};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::{MAX_DOMAIN_LEN, TargetAddress};

pub const ATYP_INET4: u8 = 1u8;
pub const ATYP_DOMAIN: u8 = 3u8;
pub const ATYP_INET6: u8 = 4u8;

/// Number of bytes `addr` occupies once encoded.
pub fn encoded_len(addr: &TargetAddress) -> usize {
    match addr {
        TargetAddress::DomainPort(domain, _) => 1 + 1 + domain.len() + 2,
        TargetAddress::SocketAddr(a) if a.is_ipv4() => 1 + 4 + 2,
        TargetAddress::SocketAddr(_) => 1 + 16 + 2,
    }
}

pub fn encode_address(addr: &TargetAddress, buf: &mut BytesMut) -> Result<(), Error> {
    buf.reserve(encoded_len(addr));
    match addr {
        TargetAddress::DomainPort(domain, port) => {
            let bytes = domain.as_bytes();
            if bytes.is_empty() || bytes.len() > MAX_DOMAIN_LEN {
                bail!("invalid domain length: {}", bytes.len());
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
            buf.put_u16(*port);
        }
        TargetAddress::SocketAddr(a) => {
            match a.ip() {
                IpAddr::V4(v4) => {
                    buf.put_u8(ATYP_INET4);
                    buf.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    buf.put_u8(ATYP_INET6);
                    buf.put_slice(&v6.octets());
                }
            }
            buf.put_u16(a.port());
        }
    }
    Ok(())
}

/// Decodes one frame from the front of `buf`, returning the address and the
/// number of bytes consumed. A truncated frame is an error.
pub fn decode_address(buf: &[u8]) -> Result<(TargetAddress, usize), Error> {
    let mut cur = buf;
    if !cur.has_remaining() {
        bail!("address frame truncated: missing type");
    }
    let atype = cur.get_u8();
    let addr = match atype {
        ATYP_INET4 => {
            if cur.remaining() < 4 + 2 {
                bail!("address frame truncated: ipv4");
            }
            let mut ip = [0u8; 4];
            cur.copy_to_slice(&mut ip);
            (ip, cur.get_u16()).into()
        }
        ATYP_DOMAIN => {
            if !cur.has_remaining() {
                bail!("address frame truncated: domain length");
            }
            let len = cur.get_u8() as usize;
            if len == 0 {
                bail!("empty domain in address frame");
            }
            if cur.remaining() < len + 2 {
                bail!("address frame truncated: domain");
            }
            let domain = String::from_utf8(cur[..len].to_vec()).context("domain not utf-8")?;
            cur.advance(len);
            TargetAddress::DomainPort(domain, cur.get_u16())
        }
        ATYP_INET6 => {
            if cur.remaining() < 16 + 2 {
                bail!("address frame truncated: ipv6");
            }
            let mut ip = [0u8; 16];
            cur.copy_to_slice(&mut ip);
            (ip, cur.get_u16()).into()
        }
        _ => bail!("not supported addr type: {}", atype),
    };
    Ok((addr, buf.len() - cur.len()))
}

pub async fn read_address<R>(socket: &mut R) -> Result<TargetAddress, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let atype = socket.read_u8().await.context("read addr type")?;
    let target = match atype {
        ATYP_INET4 => {
            let mut dst = [0u8; 4];
            socket.read_exact(&mut dst).await.context("read ipv4")?;
            let dport = socket.read_u16().await.context("read port")?;
            (dst, dport).into()
        }
        ATYP_DOMAIN => {
            let len = socket.read_u8().await.context("read domain length")?;
            if len == 0 {
                bail!("empty domain in address frame");
            }
            let mut buf = vec![0; len as usize];
            socket.read_exact(&mut buf).await.context("read domain")?;
            let domain = String::from_utf8(buf).context("domain not utf-8")?;
            let dport = socket.read_u16().await.context("read port")?;
            TargetAddress::DomainPort(domain, dport)
        }
        ATYP_INET6 => {
            let mut dst = [0u8; 16];
            socket.read_exact(&mut dst).await.context("read ipv6")?;
            let dport = socket.read_u16().await.context("read port")?;
            (dst, dport).into()
        }
        _ => bail!("not supported addr type: {}", atype),
    };
    Ok(target)
}

/// Writes the frame with a single write so that wrapping layers see it as
/// one chunk.
pub async fn write_address<W>(socket: &mut W, addr: &TargetAddress) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    encode_address(addr, &mut buf)?;
    socket.write_all(&buf).await.context("write address")
}
