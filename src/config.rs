use easy_error::{Error, ResultExt};
use serde::Deserialize;

use crate::chain::ChainConfig;
use crate::common::bypass::BypassConfig;
use crate::common::dns::DnsConfig;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub bypasses: Vec<BypassConfig>,
    #[serde(default)]
    pub resolvers: Vec<DnsConfig>,
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, Error> {
        let s = tokio::fs::read(path)
            .await
            .with_context(|| format!("read file {}", path))?;
        let s = String::from_utf8(s).context("parse utf8")?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        serde_yaml_ng::from_str(s).context("parse yaml")
    }
}

/// A listening address served by one handler. The handler section is kept
/// raw and dispatched on its `type`; chain, bypass and resolver refer to
/// the top level sections by name.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    pub handler: serde_yaml_ng::Value,
    pub chain: Option<String>,
    pub bypass: Option<String>,
    pub resolver: Option<String>,
}
