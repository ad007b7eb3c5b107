//! hoprelay: a proxy relay core.
//!
//! Accepts a connection speaking an inbound proxy protocol, works out the
//! destination, applies bypass policy, dials it directly or through a chain
//! of proxy hops, then relays bytes both ways.

pub mod chain;
pub mod cli;
pub mod common;
pub mod config;
pub mod connectors;
pub mod context;
pub mod copy;
pub mod handlers;
pub mod server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use chain::{Chain, Hop, Router, RouterBuilder};
pub use config::Config;
pub use context::{Connection, TargetAddress};
pub use server::ProxyServer;
