use easy_error::{ResultExt, Terminator};
use tracing::info;

use hoprelay::{cli, server::ProxyServer};

#[tokio::main]
async fn main() -> Result<(), Terminator> {
    let args = cli::parse_args()?;
    let server = ProxyServer::from_config_file(&args.config_file).await?;
    if args.config_test {
        info!("config file {} ok", args.config_file);
        return Ok(());
    }
    server.start().await?;
    tokio::signal::ctrl_c().await.context("wait for signal")?;
    info!("shutting down");
    server.shutdown();
    Ok(())
}
