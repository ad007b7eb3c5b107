use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use easy_error::{Error, ResultExt, bail};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, trace};

use super::{ConnectorRef, check_network, handshake};
use crate::common::http::{HttpRequest, HttpResponse};
use crate::common::metadata::{Credentials, opt_duration};
use crate::context::{Connection, TargetAddress};

/// HTTP CONNECT client.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpConnector {
    user: Option<Credentials>,
    #[serde(default, deserialize_with = "opt_duration")]
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
}

pub fn from_value(value: &serde_yaml_ng::Value) -> Result<ConnectorRef, Error> {
    let ret: HttpConnector =
        serde_yaml_ng::from_value(value.clone()).context("parse http connector")?;
    Ok(Arc::new(ret))
}

impl HttpConnector {
    pub fn new(user: Option<Credentials>) -> Self {
        Self {
            user,
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    fn request(&self, address: &TargetAddress) -> HttpRequest {
        let target = address.to_string();
        let mut req = HttpRequest::new("CONNECT", target.clone())
            .with_header("Host", target)
            .with_header("Proxy-Connection", "keep-alive");
        if let Some(ua) = &self.user_agent {
            req = req.with_header("User-Agent", ua.clone());
        }
        if let Some(user) = &self.user {
            req = req.with_header("Proxy-Authorization", user.basic_auth());
        }
        req
    }
}

#[async_trait]
impl super::Connector for HttpConnector {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        mut conn: Connection,
        network: &str,
        address: &TargetAddress,
    ) -> Result<Connection, Error> {
        let network = check_network(network)?;
        trace!(%network, %address, "http connect");
        let req = self.request(address);
        if tracing::enabled!(Level::DEBUG) {
            debug!("request:\n{}", req.redacted());
        }
        handshake(cancel, self.connect_timeout, "http connect", async move {
            req.write_to(&mut conn).await.context("send request")?;
            let resp = HttpResponse::read_from(&mut conn)
                .await
                .context("read response")?;
            if tracing::enabled!(Level::DEBUG) {
                debug!("response:\n{}", resp.head());
            }
            if resp.code != 200 {
                bail!("{}", resp.status_line());
            }
            Ok(conn)
        })
        .await
    }
}
