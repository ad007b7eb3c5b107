//! Outbound routing: direct dial, or delegation through an ordered chain of
//! proxy hops, with whole-sequence retry.

use std::{net::IpAddr, sync::Arc};

use easy_error::{Error, ResultExt, bail, err_msg};
use serde::Deserialize;
use serde_yaml_ng::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::dialers::{DialerRef, TcpDialer};
use crate::common::dns::ResolverRef;
use crate::connectors::{self, ConnectorRef, check_network};
use crate::context::{Connection, Network, TargetAddress};

/// One proxy in a chain: where it listens and how to talk to it.
pub struct Hop {
    pub name: String,
    pub addr: TargetAddress,
    pub connector: ConnectorRef,
}

impl std::fmt::Debug for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hop")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Ordered hops. Only the first hop is reached by a transport dial, so the
/// dialer belongs to the chain rather than to a hop.
pub struct Chain {
    pub name: String,
    pub hops: Vec<Hop>,
    dialer: DialerRef,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("hops", &self.hops)
            .finish()
    }
}

impl Chain {
    pub fn new(name: impl Into<String>, hops: Vec<Hop>) -> Self {
        Self {
            name: name.into(),
            hops,
            dialer: Arc::new(TcpDialer::default()),
        }
    }

    /// Dialer for the first hop; TCP by default.
    pub fn with_dialer(mut self, dialer: DialerRef) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Transport-dials the first hop, then asks every hop in turn to open a
    /// tunnel to the next hop's address, the last one to `address`.
    async fn route(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &TargetAddress,
    ) -> Result<Connection, Error> {
        let first = self
            .hops
            .first()
            .ok_or_else(|| err_msg(format!("chain {} has no hops", self.name)))?;
        trace!("dialing hop {} at {}", first.name, first.addr);
        let mut conn = self
            .dialer
            .dial(Network::Tcp, &first.addr)
            .await
            .with_context(|| format!("dial hop {} at {}", first.name, first.addr))?;
        for (i, hop) in self.hops.iter().enumerate() {
            let next = self.hops.get(i + 1).map_or(address, |h| &h.addr);
            trace!("hop {}: connect {}", hop.name, next);
            conn = hop
                .connector
                .connect(cancel, conn, network, next)
                .await
                .with_context(|| format!("hop {} connect {}", hop.name, next))?;
        }
        Ok(conn)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HopConfig {
    pub name: String,
    pub addr: TargetAddress,
    pub connector: Value,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub name: String,
    #[serde(default)]
    pub hops: Vec<HopConfig>,
    /// How the first hop is reached.
    #[serde(default)]
    pub dialer: TcpDialer,
}

impl ChainConfig {
    pub fn build(&self) -> Result<Arc<Chain>, Error> {
        let hops = self
            .hops
            .iter()
            .map(|h| {
                let connector = connectors::from_value(&h.connector)
                    .with_context(|| format!("chain {} hop {}", self.name, h.name))?;
                Ok(Hop {
                    name: h.name.clone(),
                    addr: h.addr.clone(),
                    connector,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let chain =
            Chain::new(self.name.clone(), hops).with_dialer(Arc::new(self.dialer.clone()));
        Ok(Arc::new(chain))
    }
}

/// Opens outbound connections for handlers.
pub struct Router {
    chain: Option<Arc<Chain>>,
    resolver: Option<ResolverRef>,
    retries: usize,
    dialer: DialerRef,
}

#[derive(Clone)]
pub struct RouterBuilder {
    chain: Option<Arc<Chain>>,
    resolver: Option<ResolverRef>,
    retries: usize,
    dialer: Option<DialerRef>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            chain: None,
            resolver: None,
            retries: 0,
            dialer: None,
        }
    }

    pub fn chain(mut self, chain: Option<Arc<Chain>>) -> Self {
        self.chain = chain;
        self
    }

    pub fn resolver(mut self, resolver: Option<ResolverRef>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Extra attempts after the first failed one.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Dialer used for direct connections; TCP by default.
    pub fn dialer(mut self, dialer: DialerRef) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn build(self) -> Router {
        Router {
            chain: self.chain,
            resolver: self.resolver,
            retries: self.retries,
            dialer: self
                .dialer
                .unwrap_or_else(|| Arc::new(TcpDialer::default())),
        }
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Connects to `address`, making up to `retries + 1` attempts. The
    /// error of the last attempt is returned when all fail.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &TargetAddress,
    ) -> Result<Connection, Error> {
        let net = check_network(network)?;
        let attempts = self.retries + 1;
        let mut last_err = None;
        for attempt in 1..=attempts {
            let ret = tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("dial {} cancelled", address),
                ret = self.dial_once(cancel, net, network, address) => ret,
            };
            match ret {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(attempt, attempts, %address, "dial failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| err_msg(format!("dial {} failed", address))))
    }

    async fn dial_once(
        &self,
        cancel: &CancellationToken,
        net: Network,
        network: &str,
        address: &TargetAddress,
    ) -> Result<Connection, Error> {
        match &self.chain {
            Some(chain) if !chain.is_empty() => chain.route(cancel, network, address).await,
            _ => {
                let target = self.resolve(net, address).await?;
                self.dialer.dial(net, &target).await
            }
        }
    }

    /// Substitutes the first usable resolved address for a domain when a
    /// resolver is configured.
    async fn resolve(&self, net: Network, address: &TargetAddress) -> Result<TargetAddress, Error> {
        let (resolver, host, port) = match (&self.resolver, address) {
            (Some(r), TargetAddress::DomainPort(host, port)) => (r, host, *port),
            _ => return Ok(address.clone()),
        };
        let ips = resolver
            .resolve(host)
            .await
            .with_context(|| format!("resolve {}", host))?;
        let ip = ips
            .into_iter()
            .find(|ip: &IpAddr| match net {
                Network::Tcp => true,
                Network::Tcp4 => ip.is_ipv4(),
                Network::Tcp6 => ip.is_ipv6(),
            })
            .ok_or_else(|| err_msg(format!("no {} address for {}", net, host)))?;
        trace!("resolved {} to {}", host, ip);
        Ok((ip, port).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dialers::Dialer;
    use crate::common::dns::HostsResolver;
    use crate::connectors::Connector;
    use async_trait::async_trait;
    use std::{collections::HashMap, sync::Mutex};
    use test_log::test;

    /// Records every dial and fails the first `failures` of them.
    #[derive(Default)]
    struct StubDialer {
        failures: usize,
        dialed: Mutex<Vec<TargetAddress>>,
    }

    #[async_trait]
    impl Dialer for StubDialer {
        async fn dial(&self, _network: Network, addr: &TargetAddress) -> Result<Connection, Error> {
            let n = {
                let mut dialed = self.dialed.lock().unwrap();
                dialed.push(addr.clone());
                dialed.len()
            };
            if n <= self.failures {
                bail!("dial failure {}", n);
            }
            let (a, _b) = tokio::io::duplex(64);
            Ok(Connection::detached(a))
        }
    }

    struct StubConnector {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn connect(
            &self,
            _cancel: &CancellationToken,
            conn: Connection,
            network: &str,
            address: &TargetAddress,
        ) -> Result<Connection, Error> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}->{}/{}", self.name, address, network));
            Ok(conn)
        }
    }

    fn hop(name: &'static str, addr: &str, log: &Arc<Mutex<Vec<String>>>) -> Hop {
        Hop {
            name: name.into(),
            addr: addr.parse().unwrap(),
            connector: Arc::new(StubConnector {
                name,
                log: log.clone(),
            }),
        }
    }

    #[test(tokio::test)]
    async fn chain_performs_one_handshake_per_hop() {
        let log = Arc::new(Mutex::new(vec![]));
        let dialer = Arc::new(StubDialer::default());
        let chain = Chain::new(
            "c",
            vec![
                hop("a", "10.0.0.1:1080", &log),
                hop("b", "proxy-b:8080", &log),
                hop("c", "10.0.0.3:3128", &log),
            ],
        )
        .with_dialer(dialer.clone());
        let router = Router::builder().chain(Some(Arc::new(chain))).build();
        router
            .dial(
                &CancellationToken::new(),
                "tcp",
                &"example.com:443".parse().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a->proxy-b:8080/tcp",
                "b->10.0.0.3:3128/tcp",
                "c->example.com:443/tcp",
            ]
        );
        assert_eq!(
            *dialer.dialed.lock().unwrap(),
            vec!["10.0.0.1:1080".parse::<TargetAddress>().unwrap()]
        );
    }

    #[test(tokio::test)]
    async fn empty_chain_dials_directly() {
        let dialer = Arc::new(StubDialer::default());
        let router = Router::builder()
            .chain(Some(Arc::new(Chain::new("empty", vec![]))))
            .dialer(dialer.clone())
            .build();
        let target: TargetAddress = "example.com:80".parse().unwrap();
        router
            .dial(&CancellationToken::new(), "tcp", &target)
            .await
            .unwrap();
        assert_eq!(*dialer.dialed.lock().unwrap(), vec![target]);
    }

    #[test(tokio::test)]
    async fn resolver_substitutes_first_address() {
        let dialer = Arc::new(StubDialer::default());
        let mut hosts = HashMap::new();
        hosts.insert(
            "example.com".to_owned(),
            vec!["2001:db8::1".parse().unwrap(), "93.184.216.34".parse().unwrap()],
        );
        let router = Router::builder()
            .resolver(Some(Arc::new(HostsResolver::new(hosts))))
            .dialer(dialer.clone())
            .build();
        let cancel = CancellationToken::new();
        let target = "example.com:80".parse().unwrap();
        router.dial(&cancel, "tcp", &target).await.unwrap();
        router.dial(&cancel, "tcp4", &target).await.unwrap();
        router
            .dial(&cancel, "tcp", &"10.1.1.1:22".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            *dialer.dialed.lock().unwrap(),
            vec![
                "[2001:db8::1]:80".parse::<TargetAddress>().unwrap(),
                "93.184.216.34:80".parse().unwrap(),
                "10.1.1.1:22".parse().unwrap(),
            ]
        );

        let err = router
            .dial(&cancel, "tcp", &"unknown.test:80".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("resolve unknown.test"));
    }

    #[test(tokio::test)]
    async fn retries_until_success() {
        let dialer = Arc::new(StubDialer {
            failures: 2,
            ..Default::default()
        });
        let router = Router::builder().retries(2).dialer(dialer.clone()).build();
        router
            .dial(&CancellationToken::new(), "tcp", &"1.2.3.4:80".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(dialer.dialed.lock().unwrap().len(), 3);
    }

    #[test(tokio::test)]
    async fn returns_last_error() {
        let dialer = Arc::new(StubDialer {
            failures: 10,
            ..Default::default()
        });
        let router = Router::builder().retries(1).dialer(dialer.clone()).build();
        let err = router
            .dial(&CancellationToken::new(), "tcp", &"1.2.3.4:80".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.ctx, "dial failure 2");
        assert_eq!(dialer.dialed.lock().unwrap().len(), 2);
    }

    #[test(tokio::test)]
    async fn chain_retry_repeats_whole_sequence() {
        let log = Arc::new(Mutex::new(vec![]));
        let dialer = Arc::new(StubDialer {
            failures: 1,
            ..Default::default()
        });
        let chain = Chain::new(
            "c",
            vec![hop("a", "10.0.0.1:1080", &log), hop("b", "10.0.0.2:1080", &log)],
        )
        .with_dialer(dialer.clone());
        let router = Router::builder()
            .chain(Some(Arc::new(chain)))
            .retries(3)
            .build();
        router
            .dial(&CancellationToken::new(), "tcp", &"1.2.3.4:80".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(dialer.dialed.lock().unwrap().len(), 2);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test(tokio::test)]
    async fn cancelled_dial_does_not_retry() {
        let dialer = Arc::new(StubDialer::default());
        let router = Router::builder().retries(5).dialer(dialer.clone()).build();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = router
            .dial(&cancel, "tcp", &"1.2.3.4:80".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(dialer.dialed.lock().unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn bad_network() {
        let dialer = Arc::new(StubDialer::default());
        let router = Router::builder().dialer(dialer.clone()).build();
        assert!(
            router
                .dial(&CancellationToken::new(), "udp", &"1.2.3.4:80".parse().unwrap())
                .await
                .is_err()
        );
        assert!(dialer.dialed.lock().unwrap().is_empty());
    }

    struct PipeDialer(Mutex<Option<tokio::io::DuplexStream>>);

    #[async_trait]
    impl Dialer for PipeDialer {
        async fn dial(&self, _: Network, _: &TargetAddress) -> Result<Connection, Error> {
            let pipe = self.0.lock().unwrap().take();
            pipe.map(Connection::detached)
                .ok_or_else(|| err_msg("no pipe"))
        }
    }

    #[test(tokio::test)]
    async fn http_hop_tunnels_to_target() {
        use crate::common::http::HttpRequest;
        use crate::common::metadata::Credentials;
        use crate::connectors::http::HttpConnector;
        use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

        let (near, far) = tokio::io::duplex(1024);
        let hop = Hop {
            name: "http".into(),
            addr: "192.0.2.1:3128".parse().unwrap(),
            connector: Arc::new(HttpConnector::new(Some(Credentials::new("u", "p")))),
        };
        let chain = Chain::new("one", vec![hop])
            .with_dialer(Arc::new(PipeDialer(Mutex::new(Some(near)))));
        let router = Router::builder().chain(Some(Arc::new(chain))).build();
        let proxy = tokio::spawn(async move {
            let mut far = BufReader::new(far);
            let req = HttpRequest::read_from(&mut far).await.unwrap();
            far.get_mut()
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            (req, far)
        });

        let mut conn = router
            .dial(
                &CancellationToken::new(),
                "tcp",
                &"10.0.0.5:443".parse().unwrap(),
            )
            .await
            .unwrap();
        let (req, mut far) = proxy.await.unwrap();
        assert_eq!(req.resource, "10.0.0.5:443");
        assert_eq!(req.header("Host"), Some("10.0.0.5:443"));
        assert_eq!(req.header("Proxy-Authorization"), Some("Basic dTpw"));

        conn.write_all(b"x").await.unwrap();
        conn.flush().await.unwrap();
        let mut b = [0u8; 1];
        far.read_exact(&mut b).await.unwrap();
        assert_eq!(&b, b"x");
    }

    #[test(tokio::test)]
    async fn rejected_http_hop_keeps_status_line() {
        use crate::common::http::HttpRequest;
        use crate::connectors::http::HttpConnector;
        use tokio::io::{AsyncWriteExt, BufReader};

        let (near, far) = tokio::io::duplex(1024);
        let hop = Hop {
            name: "http".into(),
            addr: "192.0.2.1:3128".parse().unwrap(),
            connector: Arc::new(HttpConnector::default()),
        };
        let chain = Chain::new("one", vec![hop])
            .with_dialer(Arc::new(PipeDialer(Mutex::new(Some(near)))));
        let router = Router::builder().chain(Some(Arc::new(chain))).build();
        let proxy = tokio::spawn(async move {
            let mut far = BufReader::new(far);
            HttpRequest::read_from(&mut far).await.unwrap();
            far.get_mut()
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
            far
        });

        let err = router
            .dial(
                &CancellationToken::new(),
                "tcp",
                &"10.0.0.5:443".parse().unwrap(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.ctx, "hop http connect 10.0.0.5:443");
        let cause = std::error::Error::source(&err)
            .and_then(|e| e.downcast_ref::<Error>())
            .unwrap();
        assert_eq!(cause.ctx, "407 Proxy Authentication Required");
        proxy.await.unwrap();
    }

    #[test]
    fn chain_from_yaml() {
        let cfg: ChainConfig = serde_yaml_ng::from_str(
            r#"
name: corp
dialer:
  timeout: 3s
hops:
  - name: first
    addr: 10.0.0.1:8080
    connector:
      type: http
      user: u:p
  - name: second
    addr: proxy.example:1080
    connector:
      type: socks5
"#,
        )
        .unwrap();
        assert_eq!(cfg.dialer.timeout, Some(std::time::Duration::from_secs(3)));
        let chain = cfg.build().unwrap();
        assert_eq!(chain.hops.len(), 2);
        assert_eq!(chain.hops[1].addr.to_string(), "proxy.example:1080");
    }

    #[test]
    fn hop_level_dialer_is_rejected() {
        let ret = serde_yaml_ng::from_str::<ChainConfig>(
            r#"
name: corp
hops:
  - name: first
    addr: 10.0.0.1:8080
    connector:
      type: http
  - name: second
    addr: proxy.example:1080
    connector:
      type: socks5
    dialer:
      timeout: 3s
"#,
        );
        assert!(ret.is_err());
    }

    #[test(tokio::test)]
    async fn only_chain_dialer_is_used() {
        let log = Arc::new(Mutex::new(vec![]));
        let dialer = Arc::new(StubDialer::default());
        let direct = Arc::new(StubDialer::default());
        let chain = Chain::new(
            "c",
            vec![hop("a", "10.0.0.1:1080", &log), hop("b", "10.0.0.2:1080", &log)],
        )
        .with_dialer(dialer.clone());
        let router = Router::builder()
            .chain(Some(Arc::new(chain)))
            .dialer(direct.clone())
            .build();
        router
            .dial(&CancellationToken::new(), "tcp", &"1.2.3.4:80".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            *dialer.dialed.lock().unwrap(),
            vec!["10.0.0.1:1080".parse::<TargetAddress>().unwrap()]
        );
        assert!(direct.dialed.lock().unwrap().is_empty());
    }
}
