use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use easy_error::{Error, bail, err_msg};
use futures::Future;
use serde_yaml_ng::Value;
use tokio_util::sync::CancellationToken;

use crate::context::{Connection, Network, TargetAddress};

pub mod http;
pub mod socks5;
pub mod ss;

/// Negotiates a tunnel through one proxy hop over an already open
/// connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Asks the peer on `conn` to open `network` to `address`. On success
    /// the returned connection carries the tunnel.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        conn: Connection,
        network: &str,
        address: &TargetAddress,
    ) -> Result<Connection, Error>;
}

pub type ConnectorRef = Arc<dyn Connector>;

pub fn from_value(value: &Value) -> Result<ConnectorRef, Error> {
    let tname = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| err_msg("missing connector type"))?;
    match tname {
        "http" => http::from_value(value),
        "socks5" => socks5::from_value(value),
        "ss" => ss::from_value(value),
        name => bail!("unknown connector type: {:?}", name),
    }
}

/// Fails before any I/O unless `network` names a stream network.
pub fn check_network(network: &str) -> Result<Network, Error> {
    network.parse()
}

/// Runs a handshake future bounded by an optional timeout and by `cancel`.
/// The deadline only covers `fut`.
pub async fn handshake<F, T>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    what: &str,
    fut: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    let bounded = async {
        match timeout {
            Some(t) => tokio::time::timeout(t, fut)
                .await
                .map_err(|_| err_msg(format!("{} timed out after {:?}", what, t)))?,
            None => fut.await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(err_msg(format!("{} cancelled", what))),
        ret = bounded => ret,
    }
}
