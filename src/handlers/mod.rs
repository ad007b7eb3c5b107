use std::sync::Arc;

use async_trait::async_trait;
use easy_error::{Error, bail, err_msg};
use serde_yaml_ng::Value;
use tokio_util::sync::CancellationToken;

use crate::chain::Chain;
use crate::common::bypass::BypassRef;
use crate::common::dns::ResolverRef;
use crate::context::Connection;

pub mod ss;

/// Terminates an inbound protocol on an accepted connection and serves it
/// to completion. Failures are logged, never returned; the connection is
/// closed when `handle` returns.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, conn: Connection);
}

pub type HandlerRef = Arc<dyn Handler>;

/// Collaborators shared with a handler at construction.
#[derive(Clone, Default)]
pub struct HandlerOptions {
    pub bypass: Option<BypassRef>,
    pub resolver: Option<ResolverRef>,
    pub chain: Option<Arc<Chain>>,
}

pub fn from_value(value: &Value, opts: HandlerOptions) -> Result<HandlerRef, Error> {
    let tname = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| err_msg("missing handler type"))?;
    match tname {
        "ss" => ss::from_value(value, opts),
        name => bail!("unknown handler type: {:?}", name),
    }
}
