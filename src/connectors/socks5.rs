use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use easy_error::{Error, ResultExt, bail};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{ConnectorRef, check_network, handshake};
use crate::common::address::{encode_address, read_address};
use crate::common::metadata::{Credentials, opt_duration};
use crate::context::{Connection, TargetAddress};

pub const SOCKS_VER_5: u8 = 5u8;
pub const SOCKS_CMD_CONNECT: u8 = 1u8;
pub const SOCKS_AUTH_NONE: u8 = 0u8;
pub const SOCKS_AUTH_USRPWD: u8 = 2u8;
pub const SOCKS_AUTH_NO_ACCEPTABLE: u8 = 0xffu8;
pub const SOCKS_AUTH_VER: u8 = 1u8;
pub const SOCKS_REPLY_OK: u8 = 0u8;

fn reply_message(code: u8) -> &'static str {
    match code {
        1 => "general socks server failure",
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "ttl expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "unknown error",
    }
}

/// SOCKS5 client, RFC 1928 with RFC 1929 username/password auth.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Socks5Connector {
    user: Option<Credentials>,
    #[serde(default, deserialize_with = "opt_duration")]
    connect_timeout: Option<Duration>,
}

pub fn from_value(value: &serde_yaml_ng::Value) -> Result<ConnectorRef, Error> {
    let ret: Socks5Connector =
        serde_yaml_ng::from_value(value.clone()).context("parse socks5 connector")?;
    check_credentials(&ret.user)?;
    Ok(Arc::new(ret))
}

// RFC 1929 carries each field behind a one byte length
fn check_credentials(user: &Option<Credentials>) -> Result<(), Error> {
    if let Some(user) = user {
        if user.username.len() > 255 || user.password.len() > 255 {
            bail!("socks5 username and password must fit in 255 bytes");
        }
    }
    Ok(())
}

impl Socks5Connector {
    pub fn new(user: Option<Credentials>) -> Result<Self, Error> {
        check_credentials(&user)?;
        Ok(Self {
            user,
            connect_timeout: None,
        })
    }

    fn methods(&self) -> &'static [u8] {
        if self.user.is_some() {
            &[SOCKS_AUTH_NONE, SOCKS_AUTH_USRPWD]
        } else {
            &[SOCKS_AUTH_NONE]
        }
    }

    async fn authenticate(&self, socket: &mut Connection) -> Result<(), Error> {
        let methods = self.methods();
        let mut buf = BytesMut::with_capacity(2 + methods.len());
        buf.put_u8(SOCKS_VER_5);
        buf.put_u8(methods.len() as u8);
        buf.put_slice(methods);
        socket.write_all(&buf).await.context("write greeting")?;
        socket.flush().await.context("flush")?;

        let ver = socket.read_u8().await.context("read version")?;
        if ver != SOCKS_VER_5 {
            bail!("unexpected socks version: {}", ver);
        }
        let method = socket.read_u8().await.context("read method")?;
        trace!("peer_method: {}", method);
        if method == SOCKS_AUTH_NO_ACCEPTABLE || !methods.contains(&method) {
            bail!("not supported auth method: {}", method);
        }
        match (method, &self.user) {
            (SOCKS_AUTH_USRPWD, Some(user)) => {
                let mut buf = BytesMut::new();
                buf.put_u8(SOCKS_AUTH_VER);
                buf.put_u8(user.username.len() as u8);
                buf.put_slice(user.username.as_bytes());
                buf.put_u8(user.password.len() as u8);
                buf.put_slice(user.password.as_bytes());
                socket.write_all(&buf).await.context("write auth")?;
                socket.flush().await.context("flush")?;
                let _ver = socket.read_u8().await.context("auth result")?;
                let result = socket.read_u8().await.context("auth result")?;
                if result != SOCKS_REPLY_OK {
                    bail!("authentication failed");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl super::Connector for Socks5Connector {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        mut conn: Connection,
        network: &str,
        address: &TargetAddress,
    ) -> Result<Connection, Error> {
        check_network(network)?;
        handshake(cancel, self.connect_timeout, "socks5 connect", async move {
            self.authenticate(&mut conn).await?;

            let mut buf = BytesMut::new();
            buf.put_slice(&[SOCKS_VER_5, SOCKS_CMD_CONNECT, 0]);
            encode_address(address, &mut buf)?;
            conn.write_all(&buf).await.context("write request")?;
            conn.flush().await.context("flush")?;

            let ver = conn.read_u8().await.context("read version")?;
            if ver != SOCKS_VER_5 {
                bail!("unexpected socks version: {}", ver);
            }
            let rep = conn.read_u8().await.context("read reply")?;
            let _rsv = conn.read_u8().await.context("read")?;
            if rep != SOCKS_REPLY_OK {
                bail!("socks5 connect {}: {}", address, reply_message(rep));
            }
            let bound = read_address(&mut conn).await.context("read bound address")?;
            trace!("socks5 bound address: {}", bound);
            Ok(conn)
        })
        .await
    }
}
