use easy_error::{Error, err_msg};
use std::{
    fmt::{Debug, Display},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, BufStream, ReadBuf},
    net::TcpStream,
};

use crate::common::try_map_v4_addr;

pub const MAX_DOMAIN_LEN: usize = 255;

#[derive(Debug)]
pub struct InvalidAddress;

impl std::fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid address")
    }
}

impl std::error::Error for InvalidAddress {}

/// Destination of a tunnel: either a resolved socket address or a domain
/// name that still needs resolving.
#[derive(Debug, Hash, Clone, Eq, PartialEq)]
pub enum TargetAddress {
    DomainPort(String, u16),
    SocketAddr(SocketAddr),
}

impl TargetAddress {
    pub fn host(&self) -> String {
        match self {
            Self::DomainPort(host, _) => host.clone(),
            Self::SocketAddr(addr) => addr.ip().to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::DomainPort(_, port) => *port,
            Self::SocketAddr(addr) => addr.port(),
        }
    }
}

impl From<SocketAddr> for TargetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::SocketAddr(addr)
    }
}

impl From<(IpAddr, u16)> for TargetAddress {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Self::SocketAddr(SocketAddr::new(ip, port))
    }
}

impl From<(Ipv4Addr, u16)> for TargetAddress {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        let a = SocketAddrV4::new(ip, port);
        Self::SocketAddr(SocketAddr::V4(a))
    }
}

impl From<([u8; 4], u16)> for TargetAddress {
    fn from((ip, port): ([u8; 4], u16)) -> Self {
        (Ipv4Addr::from(ip), port).into()
    }
}

impl From<([u8; 16], u16)> for TargetAddress {
    fn from((ip, port): ([u8; 16], u16)) -> Self {
        let ip = ip.into();
        let a = SocketAddrV6::new(ip, port, 0, 0);
        Self::SocketAddr(SocketAddr::V6(a))
    }
}

impl FromStr for TargetAddress {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(a) = SocketAddr::from_str(s) {
            return Ok(TargetAddress::SocketAddr(a));
        }
        let (host, port) = s.rsplit_once(':').ok_or(InvalidAddress)?;
        let port = port.parse().map_err(|_| InvalidAddress)?;
        if host.is_empty() || host.len() > MAX_DOMAIN_LEN || host.contains(':') {
            return Err(InvalidAddress);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok((ip, port).into());
        }
        Ok(TargetAddress::DomainPort(host.to_string(), port))
    }
}

impl Display for TargetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DomainPort(domain, port) => write!(f, "{}:{}", domain, port),
            Self::SocketAddr(addr) => write!(f, "{}", addr),
        }
    }
}

impl<'de> serde::Deserialize<'de> for TargetAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid address: {}", s)))
    }
}

/// Stream network requested by a dial. Only TCP flavours are tunnelable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
}

impl FromStr for Network {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            _ => Err(err_msg(format!(
                "network {} unsupported, should be tcp, tcp4 or tcp6",
                s
            ))),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        };
        f.write_str(s)
    }
}

pub trait IOStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T> IOStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
pub type IOBufStream = BufStream<Box<dyn IOStream>>;

pub fn make_buffered_stream<T: IOStream + 'static>(stream: T) -> IOBufStream {
    BufStream::new(Box::new(stream))
}

/// A buffered duplex stream together with the socket addresses of its
/// transport. Dropping it closes the underlying stream.
pub struct Connection {
    stream: IOBufStream,
    local: SocketAddr,
    remote: SocketAddr,
}

impl Connection {
    pub fn new<T: IOStream + 'static>(stream: T, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            stream: make_buffered_stream(stream),
            local,
            remote,
        }
    }

    /// Wraps a stream that has no meaningful socket addresses, such as an
    /// in-memory pipe.
    pub fn detached<T: IOStream + 'static>(stream: T) -> Self {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        Self::new(stream, unspecified, unspecified)
    }

    /// Dual-stack listeners report v4 peers as v4-mapped v6 addresses; they
    /// are unmapped here.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let local = try_map_v4_addr(stream.local_addr()?);
        let remote = try_map_v4_addr(stream.peer_addr()?);
        Ok(Self::new(stream, local, remote))
    }

    /// Replaces the byte stream while keeping the transport addresses, used
    /// when a protocol layer wraps the connection.
    pub fn map<T, F>(self, f: F) -> Self
    where
        T: IOStream + 'static,
        F: FnOnce(Self) -> T,
    {
        let (local, remote) = (self.local, self.remote);
        Self::new(f(self), local, remote)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncBufRead for Connection {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().stream).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().stream).consume(amt)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
