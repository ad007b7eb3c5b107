use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use easy_error::{Error, ResultExt, bail};
use hickory_resolver::{
    TokioResolver,
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::xfer::Protocol,
    system_conf::read_system_conf,
};
use serde::Deserialize;
use tracing::trace;

/// Turns a host name into addresses, in order of preference.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Error>;
}

pub type ResolverRef = Arc<dyn Resolver>;

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    V4Only,
    V6Only,
    V4First,
    #[default]
    V6First,
}

impl AddressFamily {
    fn arrange(&self, addrs: Vec<IpAddr>) -> Vec<IpAddr> {
        let (v4, v6): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.is_ipv4());
        match self {
            Self::V4Only => v4,
            Self::V6Only => v6,
            Self::V4First => v4.into_iter().chain(v6).collect(),
            Self::V6First => v6.into_iter().chain(v4).collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    pub name: String,
    #[serde(default = "default_servers")]
    pub servers: String,
    #[serde(default)]
    pub family: AddressFamily,
    /// Static entries consulted before any name server.
    #[serde(default)]
    pub hosts: HashMap<String, Vec<IpAddr>>,
}

fn default_servers() -> String {
    "system".to_string()
}

impl DnsConfig {
    pub fn build(&self) -> Result<ResolverRef, Error> {
        let (config, opts) = Self::parse_servers(&self.servers)?;
        let resolver =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();
        Ok(Arc::new(DnsResolver {
            hosts: HostsResolver::new(self.hosts.clone()),
            family: self.family,
            resolver,
        }))
    }

    fn parse_servers(servers: &str) -> Result<(ResolverConfig, ResolverOpts), Error> {
        match servers {
            "system" => read_system_conf().context("Failed to read system configuration"),
            "google" => Ok((ResolverConfig::google(), ResolverOpts::default())),
            "cloudflare" => Ok((ResolverConfig::cloudflare(), ResolverOpts::default())),
            _ => {
                let mut config = ResolverConfig::new();
                for server in servers.split(',') {
                    let server = server.trim();
                    let socket_addr = server
                        .parse::<IpAddr>()
                        .map(|addr| SocketAddr::new(addr, 53))
                        .or_else(|_| server.parse::<SocketAddr>())
                        .with_context(|| {
                            format!("Failed to parse DNS server address: {}", server)
                        })?;
                    config.add_name_server(NameServerConfig::new(socket_addr, Protocol::Udp));
                }
                Ok((config, ResolverOpts::default()))
            }
        }
    }
}

/// Resolver backed by hickory, with a static hosts table in front of it.
pub struct DnsResolver {
    hosts: HostsResolver,
    family: AddressFamily,
    resolver: TokioResolver,
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        let found = match self.hosts.lookup(host) {
            Some(addrs) => addrs.to_vec(),
            None => self
                .resolver
                .lookup_ip(host)
                .await
                .with_context(|| format!("lookup_ip {}", host))?
                .iter()
                .collect(),
        };
        let addrs = self.family.arrange(found);
        trace!("resolved {} => {:?}", host, addrs);
        if addrs.is_empty() {
            bail!("No address found for {}", host);
        }
        Ok(addrs)
    }
}

/// Fixed host name table.
#[derive(Debug, Clone, Default)]
pub struct HostsResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl HostsResolver {
    pub fn new(table: HashMap<String, Vec<IpAddr>>) -> Self {
        let table = table
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { table }
    }

    fn lookup(&self, host: &str) -> Option<&[IpAddr]> {
        self.table
            .get(&host.to_ascii_lowercase())
            .map(Vec::as_slice)
    }
}

#[async_trait]
impl Resolver for HostsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        match self.lookup(host) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.to_vec()),
            _ => bail!("No address found for {}", host),
        }
    }
}
