use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use easy_error::{Error, ResultExt, bail, err_msg};
use serde::Deserialize;
use tokio::net::TcpSocket;
use tracing::trace;

use crate::common::metadata::opt_duration;
use crate::context::{Connection, Network, TargetAddress};

/// Opens a transport connection to the immediate next hop.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: Network, addr: &TargetAddress) -> Result<Connection, Error>;
}

pub type DialerRef = Arc<dyn Dialer>;

/// Keeps only the addresses `network` allows.
pub fn filter_family(network: Network, addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    addrs
        .into_iter()
        .filter(|a| match network {
            Network::Tcp => true,
            Network::Tcp4 => a.is_ipv4(),
            Network::Tcp6 => a.is_ipv6(),
        })
        .collect()
}

/// Plain TCP dialer.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TcpDialer {
    pub bind: Option<IpAddr>,
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,
    #[serde(default, deserialize_with = "opt_duration")]
    pub timeout: Option<Duration>,
}

fn default_keepalive() -> bool {
    true
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            bind: None,
            keepalive: default_keepalive(),
            timeout: None,
        }
    }
}

impl TcpDialer {
    async fn connect_one(&self, remote: SocketAddr) -> Result<Connection, Error> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4().context("socket v4")?
        } else {
            TcpSocket::new_v6().context("socket v6")?
        };
        if let Some(bind_ip) = self.bind {
            socket.bind(SocketAddr::new(bind_ip, 0)).context("bind")?;
        }
        if self.keepalive {
            socket.set_keepalive(true).context("setsockopt")?;
        }
        let connect = socket.connect(remote);
        let stream = match self.timeout {
            Some(t) => tokio::time::timeout(t, connect)
                .await
                .map_err(|_| err_msg(format!("connect {} timed out", remote)))?,
            None => connect.await,
        }
        .with_context(|| format!("connect {}", remote))?;
        Connection::from_tcp(stream).context("socket address")
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: Network, addr: &TargetAddress) -> Result<Connection, Error> {
        let candidates = match addr {
            TargetAddress::SocketAddr(a) => vec![*a],
            TargetAddress::DomainPort(host, port) => tokio::net::lookup_host((host.as_str(), *port))
                .await
                .with_context(|| format!("lookup {}", host))?
                .collect(),
        };
        let candidates = filter_family(network, candidates);
        if candidates.is_empty() {
            bail!("no {} address for {}", network, addr);
        }
        let mut last_err = None;
        for remote in candidates {
            trace!("dialing {} via {}", addr, remote);
            match self.connect_one(remote).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| err_msg(format!("dial {} failed", addr))))
    }
}
