use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use easy_error::{Error, ResultExt, err_msg};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

use super::{HandlerOptions, HandlerRef};
use crate::chain::Router;
use crate::common::address::read_address;
use crate::common::bypass::BypassRef;
use crate::common::cipher::{Cipher, CipherStream};
use crate::common::metadata::opt_duration;
use crate::context::{Connection, TargetAddress};
use crate::copy::relay;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SsHandlerConfig {
    method: Option<String>,
    password: Option<String>,
    #[serde(default, deserialize_with = "opt_duration")]
    read_timeout: Option<Duration>,
    #[serde(default)]
    retries: usize,
    #[serde(default = "default_drain_timeout", deserialize_with = "opt_duration")]
    drain_timeout: Option<Duration>,
}

fn default_drain_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

pub fn from_value(value: &serde_yaml_ng::Value, opts: HandlerOptions) -> Result<HandlerRef, Error> {
    let cfg: SsHandlerConfig =
        serde_yaml_ng::from_value(value.clone()).context("parse ss handler")?;
    let cipher = match (&cfg.method, &cfg.password) {
        (Some(method), Some(password)) => Some(Cipher::new(method, password)?),
        (None, None) => None,
        (Some(_), None) => return Err(err_msg("ss handler: method set without password")),
        (None, Some(_)) => return Err(err_msg("ss handler: password set without method")),
    };
    let router = Router::builder()
        .chain(opts.chain)
        .resolver(opts.resolver)
        .retries(cfg.retries)
        .build();
    let handler = SsHandler {
        cipher,
        read_timeout: cfg.read_timeout,
        drain_timeout: cfg.drain_timeout,
        bypass: opts.bypass,
        router,
    };
    Ok(Arc::new(handler))
}

/// Inbound side of the ss protocol: an optionally encrypted stream that
/// starts with the address frame of the destination.
pub struct SsHandler {
    cipher: Option<Cipher>,
    read_timeout: Option<Duration>,
    drain_timeout: Option<Duration>,
    bypass: Option<BypassRef>,
    router: Router,
}

impl SsHandler {
    pub fn new(cipher: Option<Cipher>, router: Router) -> Self {
        Self {
            cipher,
            read_timeout: None,
            drain_timeout: default_drain_timeout(),
            bypass: None,
            router,
        }
    }

    pub fn with_bypass(mut self, bypass: BypassRef) -> Self {
        self.bypass = Some(bypass);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// `None` closes a connection with a bad frame right away.
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    async fn read_target<R>(&self, socket: &mut R) -> Result<TargetAddress, Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        match self.read_timeout {
            Some(t) => tokio::time::timeout(t, read_address(socket))
                .await
                .map_err(|_| err_msg(format!("read address timed out after {:?}", t)))?,
            None => read_address(socket).await,
        }
    }

    /// Swallows whatever the peer still sends, so a prober cannot tell a bad
    /// frame from a slow upstream by the time the connection closes.
    async fn drain(&self, mut conn: Connection) {
        let Some(t) = self.drain_timeout else {
            return;
        };
        let mut sink = tokio::io::sink();
        match tokio::time::timeout(t, tokio::io::copy(&mut conn, &mut sink)).await {
            Ok(Ok(n)) => debug!("discarded {} bytes", n),
            Ok(Err(e)) => debug!("drain: {}", e),
            Err(_) => debug!("drain timed out after {:?}", t),
        }
    }

    async fn serve(&self, cancel: &CancellationToken, conn: Connection) {
        let remote = conn.remote_addr();
        match &self.cipher {
            Some(cipher) => {
                let mut stream = CipherStream::new(conn, cipher.clone());
                match self.read_target(&mut stream).await {
                    Ok(addr) => self.forward(cancel, remote, stream, addr).await,
                    Err(e) => {
                        error!("{}: {:?}", e.ctx, e.cause);
                        self.drain(stream.into_inner()).await
                    }
                }
            }
            None => {
                let mut conn = conn;
                match self.read_target(&mut conn).await {
                    Ok(addr) => self.forward(cancel, remote, conn, addr).await,
                    Err(e) => {
                        error!("{}: {:?}", e.ctx, e.cause);
                        self.drain(conn).await
                    }
                }
            }
        }
    }

    async fn forward<S>(
        &self,
        cancel: &CancellationToken,
        remote: SocketAddr,
        inbound: S,
        addr: TargetAddress,
    ) where
        S: AsyncRead + AsyncWrite + Send,
    {
        Span::current().record("dst", field::display(&addr));
        info!("{} >> {}", remote, addr);

        if let Some(bypass) = &self.bypass {
            if bypass.contains(&addr.host()) {
                info!("bypass: {}", addr);
                return;
            }
        }

        let outbound = match self.router.dial(cancel, "tcp", &addr).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("dial {}: {} cause: {:?}", addr, e.ctx, e.cause);
                return;
            }
        };

        let start = Instant::now();
        info!("{} <-> {}", remote, addr);
        match relay(inbound, outbound).await {
            Ok(traffic) => info!(
                duration = ?start.elapsed(),
                sent = traffic.sent,
                received = traffic.received,
                "{} >-< {}",
                remote,
                addr
            ),
            Err(e) => warn!(
                duration = ?start.elapsed(),
                "{} >-< {}: {} cause: {:?}",
                remote,
                addr,
                e.ctx,
                e.cause
            ),
        }
    }
}

#[async_trait]
impl super::Handler for SsHandler {
    async fn handle(&self, cancel: &CancellationToken, conn: Connection) {
        let start = Instant::now();
        let remote = conn.remote_addr();
        let local = conn.local_addr();
        let span = info_span!("ss", %remote, %local, dst = field::Empty);
        async move {
            info!("{} <> {}", remote, local);
            self.serve(cancel, conn).await;
            info!(duration = ?start.elapsed(), "{} >< {}", remote, local);
        }
        .instrument(span)
        .await
    }
}
