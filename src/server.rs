use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use easy_error::{Error, ResultExt, bail, err_msg};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    chain::Chain,
    common::{bypass::BypassRef, dns::ResolverRef},
    config::{Config, ServiceConfig},
    context::Connection,
    handlers::{self, HandlerOptions, HandlerRef},
};

/// A listening address and the handler serving it.
pub struct Service {
    pub name: String,
    pub addr: String,
    pub handler: HandlerRef,
}

pub struct ProxyServer {
    pub services: Vec<Arc<Service>>,
    cancel: CancellationToken,
}

fn index_unique<T>(kind: &str, items: Vec<(String, T)>) -> Result<HashMap<String, T>, Error> {
    let mut ret = HashMap::new();
    for (name, item) in items {
        if ret.insert(name.clone(), item).is_some() {
            bail!("duplicate {} name: {}", kind, name);
        }
    }
    Ok(ret)
}

fn lookup<T: Clone>(
    kind: &str,
    table: &HashMap<String, T>,
    name: &Option<String>,
) -> Result<Option<T>, Error> {
    match name {
        None => Ok(None),
        Some(n) => table
            .get(n)
            .cloned()
            .map(Some)
            .ok_or_else(|| err_msg(format!("{} not found: {}", kind, n))),
    }
}

impl ProxyServer {
    pub async fn from_config_file(config_path: &str) -> Result<Self, Error> {
        let cfg = Config::load(config_path).await?;
        Self::from_config(&cfg)
    }

    /// Builds every component up front, so configuration errors surface
    /// before anything listens.
    pub fn from_config(cfg: &Config) -> Result<Self, Error> {
        let chains = cfg
            .chains
            .iter()
            .map(|c| Ok((c.name.clone(), c.build()?)))
            .collect::<Result<Vec<(String, Arc<Chain>)>, Error>>()?;
        let chains = index_unique("chain", chains)?;

        let bypasses = cfg
            .bypasses
            .iter()
            .map(|b| Ok((b.name.clone(), b.build()?)))
            .collect::<Result<Vec<(String, BypassRef)>, Error>>()?;
        let bypasses = index_unique("bypass", bypasses)?;

        let resolvers = cfg
            .resolvers
            .iter()
            .map(|r| {
                let resolver = r.build().with_context(|| format!("resolver {}", r.name))?;
                Ok((r.name.clone(), resolver))
            })
            .collect::<Result<Vec<(String, ResolverRef)>, Error>>()?;
        let resolvers = index_unique("resolver", resolvers)?;

        let mut services = Vec::with_capacity(cfg.services.len());
        for svc in &cfg.services {
            let service = Self::build_service(svc, &chains, &bypasses, &resolvers)
                .with_context(|| format!("service {}", svc.name))?;
            services.push(Arc::new(service));
        }
        Ok(Self::new(services))
    }

    fn build_service(
        svc: &ServiceConfig,
        chains: &HashMap<String, Arc<Chain>>,
        bypasses: &HashMap<String, BypassRef>,
        resolvers: &HashMap<String, ResolverRef>,
    ) -> Result<Service, Error> {
        let opts = HandlerOptions {
            chain: lookup("chain", chains, &svc.chain)?,
            bypass: lookup("bypass", bypasses, &svc.bypass)?,
            resolver: lookup("resolver", resolvers, &svc.resolver)?,
        };
        Ok(Service {
            name: svc.name.clone(),
            addr: svc.addr.clone(),
            handler: handlers::from_value(&svc.handler, opts)?,
        })
    }

    pub fn new(services: Vec<Arc<Service>>) -> Self {
        Self {
            services,
            cancel: CancellationToken::new(),
        }
    }

    /// Binds every service and starts accepting. Returns the bound
    /// addresses in service order.
    pub async fn start(&self) -> Result<Vec<SocketAddr>, Error> {
        let mut listeners = Vec::with_capacity(self.services.len());
        for svc in &self.services {
            let listener = TcpListener::bind(&svc.addr)
                .await
                .with_context(|| format!("{}: bind {}", svc.name, svc.addr))?;
            let local = listener.local_addr().context("local addr")?;
            info!("{} listening on {}", svc.name, local);
            listeners.push((svc.clone(), listener, local));
        }
        let mut addrs = Vec::with_capacity(listeners.len());
        for (svc, listener, local) in listeners {
            tokio::spawn(accept(svc, listener, self.cancel.clone()));
            addrs.push(local);
        }
        Ok(addrs)
    }

    /// Stops accepting and cancels in-flight dials. Established tunnels run
    /// until either side closes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn accept(svc: Arc<Service>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("{} stopped", svc.name);
                return;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, source)) => {
                debug!("{}: connected from {}", svc.name, source);
                let conn = match Connection::from_tcp(socket) {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("{}: {}", svc.name, e);
                        continue;
                    }
                };
                let handler = svc.handler.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { handler.handle(&cancel, conn).await });
            }
            Err(e) => {
                // EMFILE and friends are transient
                warn!("{}: accept error: {}", svc.name, e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
