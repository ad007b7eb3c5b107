use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use easy_error::{Error, ResultExt};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{ConnectorRef, check_network, handshake};
use crate::common::address::write_address;
use crate::common::cipher::{Cipher, CipherStream};
use crate::common::metadata::opt_duration;
use crate::context::{Connection, TargetAddress};

/// Client side of the ss protocol: the tunnel is the connection wrapped in
/// the configured stream cipher, opened by the address frame of the target.
#[derive(Debug, Clone)]
pub struct SsConnector {
    cipher: Cipher,
    connect_timeout: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SsConnectorConfig {
    method: String,
    password: String,
    #[serde(default, deserialize_with = "opt_duration")]
    connect_timeout: Option<Duration>,
}

pub fn from_value(value: &serde_yaml_ng::Value) -> Result<ConnectorRef, Error> {
    let cfg: SsConnectorConfig =
        serde_yaml_ng::from_value(value.clone()).context("parse ss connector")?;
    let cipher = Cipher::new(&cfg.method, &cfg.password)?;
    Ok(Arc::new(SsConnector {
        cipher,
        connect_timeout: cfg.connect_timeout,
    }))
}

impl SsConnector {
    pub fn new(cipher: Cipher) -> Self {
        Self {
            cipher,
            connect_timeout: None,
        }
    }
}

#[async_trait]
impl super::Connector for SsConnector {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        conn: Connection,
        network: &str,
        address: &TargetAddress,
    ) -> Result<Connection, Error> {
        check_network(network)?;
        let cipher = self.cipher.clone();
        let mut conn = conn.map(|c| CipherStream::new(c, cipher));
        handshake(cancel, self.connect_timeout, "ss connect", async move {
            write_address(&mut conn, address).await?;
            conn.flush().await.context("flush")?;
            Ok(conn)
        })
        .await
    }
}
